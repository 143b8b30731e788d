use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;

use admit_limit::RateLimitController;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

// Uncontended begin/end pairs: the cost of the bookkeeping alone
fn bench_uncontended(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("uncontended");

    for rate in [1usize, 16, 256] {
        let controller = RateLimitController::new(NonZeroUsize::new(rate).unwrap(), Duration::ZERO);
        group.bench_with_input(BenchmarkId::from_parameter(rate), &controller, |b, rl| {
            b.to_async(&rt).iter(|| async move {
                let id = rl.begin_admission().await;
                rl.end_admission(black_box(id));
            })
        });
    }

    group.finish();
}

// Many tasks fighting over a small concurrency cap
fn bench_contended(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("contended");

    for tasks in [8usize, 64] {
        let controller = Arc::new(RateLimitController::new(
            NonZeroUsize::new(4).unwrap(),
            Duration::ZERO,
        ));
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &n| {
            b.to_async(&rt).iter(|| {
                let controller = Arc::clone(&controller);
                async move {
                    let mut handles = Vec::with_capacity(n);
                    for _ in 0..n {
                        let controller = Arc::clone(&controller);
                        handles.push(tokio::spawn(async move {
                            let permit = controller.acquire_owned().await;
                            tokio::task::yield_now().await;
                            drop(permit);
                        }));
                    }
                    for handle in handles {
                        handle.await.unwrap();
                    }
                }
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_uncontended, bench_contended);
criterion_main!(benches);
