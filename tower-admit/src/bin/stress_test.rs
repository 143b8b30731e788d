use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use admit_limit::RateLimitController;
use clap::Parser;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio::time::sleep;
use tower::BoxError;
use tower::Service;
use tower::ServiceExt;
use tower::service_fn;
use tower_admit::AdmitError;
use tower_admit::RetryPolicy;
use tower_admit::make_retrying_svc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Drive a retrying, admission-controlled service with concurrent requests.
#[derive(Parser, Debug)]
#[command(name = "stress_test")]
struct Args {
    /// Maximum admissions in flight, and starts per interval
    #[arg(long, default_value_t = 10)]
    rate: usize,

    /// Length of the rolling window
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    interval: Duration,

    /// Upper bound of the random delay added to window waits
    #[arg(long, default_value = "0s", value_parser = humantime::parse_duration)]
    jitter: Duration,

    /// Number of concurrent requests
    #[arg(long, default_value_t = 100)]
    requests: usize,

    /// Simulated duration of each unit of work
    #[arg(long, default_value = "50ms", value_parser = humantime::parse_duration)]
    latency: Duration,

    /// Probability that a unit of work fails
    #[arg(long, default_value_t = 0.1)]
    failure_rate: f64,

    /// Attempts per request, including the first
    #[arg(long, default_value_t = 3)]
    max_attempts: usize,

    /// Delay before the first retry; doubles on every further retry
    #[arg(long, default_value = "100ms", value_parser = humantime::parse_duration)]
    retry_delay: Duration,

    /// Seed for failures and jitter
    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    /// Checks every argument before anything is built from them.
    fn validate(&self) -> Result<(NonZeroUsize, NonZeroUsize), BoxError> {
        let rate = NonZeroUsize::new(self.rate).ok_or("--rate must be at least 1")?;
        let max_attempts =
            NonZeroUsize::new(self.max_attempts).ok_or("--max-attempts must be at least 1")?;
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err("--failure-rate must be between 0 and 1".into());
        }
        Ok((rate, max_attempts))
    }
}

/// Shared state of the simulated unit of work.
struct Work {
    latency: Duration,
    failure_rate: f64,
    rng: Mutex<StdRng>,
    starts: Mutex<Vec<Instant>>,
    // Start of the first attempt of every request
    first_starts: Mutex<Vec<Option<Instant>>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Work {
    async fn perform(&self, req: usize) -> Result<usize, BoxError> {
        let now = Instant::now();
        self.starts.lock().push(now);
        if let Some(first) = self.first_starts.lock().get_mut(req) {
            first.get_or_insert(now);
        }
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        sleep(self.latency).await;
        let failed = self.rng.lock().random_bool(self.failure_rate);

        self.active.fetch_sub(1, Ordering::SeqCst);
        if failed {
            return Err(format!("request {req} failed").into());
        }
        Ok(req)
    }
}

// Starts are recorded by the work itself, a little after admission
const WINDOW_SLACK: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct Outcomes {
    successes: usize,
    failures: usize,
    rejections: usize,
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Shortest span covering `rate + 1` consecutive starts, if there are that many.
fn tightest_window(starts: &mut [Instant], rate: usize) -> Option<Duration> {
    starts.sort_unstable();
    starts
        .windows(rate + 1)
        .map(|span| span[rate].duration_since(span[0]))
        .min()
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let (rate, max_attempts) = args.validate()?;
    let seed = args.seed.unwrap_or_else(rand::random);

    let controller = Arc::new(
        RateLimitController::new(rate, args.interval)
            .with_jitter(args.jitter)
            .with_seed(seed),
    );

    let work = Arc::new(Work {
        latency: args.latency,
        failure_rate: args.failure_rate,
        rng: Mutex::new(StdRng::seed_from_u64(seed)),
        starts: Mutex::new(Vec::with_capacity(args.requests)),
        first_starts: Mutex::new(vec![None; args.requests]),
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });

    let policy = RetryPolicy::new(max_attempts).with_initial_delay(args.retry_delay);
    let svc = {
        let work = Arc::clone(&work);
        make_retrying_svc(
            Arc::clone(&controller),
            policy,
            service_fn(move |req: usize| {
                let work = Arc::clone(&work);
                async move { work.perform(req).await }
            }),
        )
    };

    info!(?args, seed, "starting stress test");

    let mut hist_ready = Histogram::<u64>::new_with_bounds(1, 3_600_000_000, 3)?;
    let mut hist_elapsed = Histogram::<u64>::new_with_bounds(1, 3_600_000_000, 3)?;
    let mut outcomes = Outcomes::default();

    let barrier = Arc::new(Barrier::new(args.requests));
    let mut tasks = JoinSet::new();
    let start = Instant::now();

    for req in 0..args.requests {
        let mut local_svc = svc.clone();
        let bar = Arc::clone(&barrier);
        tasks.spawn(async move {
            bar.wait().await;
            let req_start = Instant::now();
            let res = match local_svc.ready().await {
                Ok(ready_svc) => ready_svc.call(req).await,
                Err(err) => Err(err),
            };
            (req, req_start, res, req_start.elapsed())
        });
    }

    while let Some(task) = tasks.join_next().await {
        let (req, req_start, res, elapsed) = task?;
        let first = work.first_starts.lock().get(req).copied().flatten();
        if let Some(first) = first {
            hist_ready.saturating_record(micros(first.saturating_duration_since(req_start)));
        }
        match res {
            Ok(_) => {
                outcomes.successes += 1;
                hist_elapsed.saturating_record(micros(elapsed));
            }
            Err(err) if err.is::<AdmitError>() => outcomes.rejections += 1,
            Err(_) => outcomes.failures += 1,
        }
    }
    let total_duration = start.elapsed();

    let mut starts = std::mem::take(&mut *work.starts.lock());

    println!("--- Admission stress test (seed {seed}) ---");
    println!("Rate/Interval:   {} per {:?}", rate, args.interval);
    println!("Total Duration:  {total_duration:.2?}");
    println!("Success/Total:   {}/{}", outcomes.successes, args.requests);
    println!("Failures:        {}", outcomes.failures);
    if outcomes.rejections > 0 {
        println!("Rejections:      {}", outcomes.rejections);
    }
    println!("Attempts:        {}", starts.len());
    println!("Peak In-Flight:  {}", work.peak.load(Ordering::SeqCst));

    if outcomes.successes > 0 {
        println!("P50 (Elapsed):   {}µs", hist_elapsed.value_at_quantile(0.5));
        println!("P99 (Elapsed):   {}µs", hist_elapsed.value_at_quantile(0.99));
    }
    if !hist_ready.is_empty() {
        println!("P50 (Admission): {}µs", hist_ready.value_at_quantile(0.5));
        println!("P99 (Admission): {}µs", hist_ready.value_at_quantile(0.99));
    }

    match tightest_window(&mut starts, rate.get()) {
        Some(span) if span + WINDOW_SLACK < args.interval => {
            println!(
                "Window Check:    FAILED ({} starts within {span:?})",
                rate.get() + 1
            );
            return Err("rolling window limit was exceeded".into());
        }
        Some(span) => println!(
            "Window Check:    ok (tightest {} starts span {span:?})",
            rate.get() + 1
        ),
        None => println!("Window Check:    ok (fewer than {} starts)", rate.get() + 1),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(args: &[&str]) -> Result<(NonZeroUsize, NonZeroUsize), String> {
        let args = Args::try_parse_from(std::iter::once("stress_test").chain(args.iter().copied()))
            .map_err(|err| err.to_string())?;
        args.validate().map_err(|err| err.to_string())
    }

    #[test]
    fn defaults_are_valid() {
        let (rate, max_attempts) = validate(&[]).unwrap();
        assert_eq!(rate.get(), 10);
        assert_eq!(max_attempts.get(), 3);
    }

    #[test]
    fn it_rejects_bad_arguments() {
        assert_eq!(
            validate(&["--rate", "0"]).unwrap_err(),
            "--rate must be at least 1"
        );
        assert_eq!(
            validate(&["--max-attempts", "0"]).unwrap_err(),
            "--max-attempts must be at least 1"
        );
        assert_eq!(
            validate(&["--failure-rate", "1.5"]).unwrap_err(),
            "--failure-rate must be between 0 and 1"
        );
        assert_eq!(
            validate(&["--failure-rate", "NaN"]).unwrap_err(),
            "--failure-rate must be between 0 and 1"
        );
    }

    #[test]
    fn durations_use_humantime() {
        let args = Args::try_parse_from(["stress_test", "--interval", "1s 300ms"]).unwrap();
        assert_eq!(args.interval, Duration::from_millis(1300));
    }

    #[test]
    fn it_finds_the_tightest_window() {
        let base = Instant::now();
        let mut starts: Vec<Instant> = [0u64, 250, 10, 400, 120]
            .iter()
            .map(|ms| base + Duration::from_millis(*ms))
            .collect();

        assert_eq!(
            tightest_window(&mut starts, 2),
            Some(Duration::from_millis(120))
        );
        assert_eq!(tightest_window(&mut starts, 5), None);
    }
}
