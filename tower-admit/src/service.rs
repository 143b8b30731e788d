use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::ready;
use std::time::Duration;

use admit_limit::OwnedAdmissionPermit;
use admit_limit::RateLimitController;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use pin_project_lite::pin_project;
use tokio::time::Instant;
use tower::BoxError;
use tower::Service;
use tracing::debug;

use crate::error::AdmitError;

type AcquireFuture =
    Pin<Box<dyn Future<Output = Result<OwnedAdmissionPermit, AdmitError>> + Send + 'static>>;

#[derive(Clone, Debug)]
struct AdmissionServiceMetrics {
    admitted: Counter<u64>,
    rejected: Counter<u64>,
    wait: Histogram<f64>,
}

impl AdmissionServiceMetrics {
    fn new() -> Self {
        let meter = global::meter("admission_service");
        Self {
            admitted: meter.u64_counter("admitted").build(),
            rejected: meter.u64_counter("rejected").build(),
            wait: meter
                .f64_histogram("admission_wait")
                .with_unit("s")
                .build(),
        }
    }

    fn reject(&self, err: &AdmitError) {
        let reason = match err {
            AdmitError::Timeout => "timeout",
            AdmitError::Overloaded => "overloaded",
            AdmitError::RateLimited { .. } => "rate_limited",
        };
        self.rejected.add(1, &[KeyValue::new("reason", reason)]);
    }
}

/// Runs every request of the inner service under an admission granted by a
/// shared [`RateLimitController`].
///
/// The admission is acquired in `poll_ready`, travels with the response
/// future, and is released as soon as the inner future completes, whether
/// it succeeded or failed, or when the response future is dropped.
pub struct AdmissionService<S> {
    inner: S,
    controller: Arc<RateLimitController>,
    acquire: Option<AcquireFuture>,
    permit: Option<OwnedAdmissionPermit>,
    fail_fast: bool,
    timeout: Option<Duration>,
    wait_start: Option<Instant>,
    instruments: AdmissionServiceMetrics,
}

pin_project! {
    /// A future that holds an admission until the inner service responds.
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        permit: Option<OwnedAdmissionPermit>,
    }
}

impl<F> Future for ResponseFuture<F>
where
    F: Future,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let output = ready!(this.inner.poll(cx));
        // Release before the caller sees the outcome
        drop(this.permit.take());
        Poll::Ready(output)
    }
}

impl<S: fmt::Debug> fmt::Debug for AdmissionService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionService")
            .field("inner", &self.inner)
            .field("controller", &self.controller)
            .field("acquiring", &self.acquire.is_some())
            .field("permit", &self.permit)
            .field("fail_fast", &self.fail_fast)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// Manually implement Clone because the pending acquisition cannot be cloned
impl<S> Clone for AdmissionService<S>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            controller: Arc::clone(&self.controller),
            // A clone starts without a pending acquisition or permit
            acquire: None,
            permit: None,
            fail_fast: self.fail_fast,
            timeout: self.timeout,
            wait_start: None,
            instruments: self.instruments.clone(),
        }
    }
}

impl<S, Req> Service<Req> for AdmissionService<S>
where
    S: Service<Req, Error = BoxError>,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // 1. Check inner service readiness FIRST so no slot is held for a
        //    service that cannot take the request
        match self.inner.poll_ready(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }

        // 2. Already admitted by an earlier poll
        if self.permit.is_some() {
            return Poll::Ready(Ok(()));
        }

        // 3. Fail fast: admit now or reject with the controller's reason
        if self.fail_fast {
            return match self.controller.try_acquire_owned() {
                Ok(permit) => {
                    self.admitted(permit, Duration::ZERO);
                    Poll::Ready(Ok(()))
                }
                Err(reason) => Poll::Ready(Err(self.rejected(reason.into()))),
            };
        }

        // 4. Otherwise wait, bounded by the timeout if there is one
        let start = *self.wait_start.get_or_insert_with(Instant::now);
        let acquire = self
            .acquire
            .get_or_insert_with(|| acquire_permit(Arc::clone(&self.controller), self.timeout));

        let outcome = ready!(acquire.as_mut().poll(cx));
        self.acquire = None;
        self.wait_start = None;

        match outcome {
            Ok(permit) => {
                self.admitted(permit, start.elapsed());
                Poll::Ready(Ok(()))
            }
            Err(err) => Poll::Ready(Err(self.rejected(err))),
        }
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let permit = self
            .permit
            .take()
            .expect("poll_ready must return Ready(Ok(())) before call");

        ResponseFuture {
            inner: self.inner.call(req),
            permit: Some(permit),
        }
    }
}

fn acquire_permit(
    controller: Arc<RateLimitController>,
    timeout: Option<Duration>,
) -> AcquireFuture {
    Box::pin(async move {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, controller.acquire_owned())
                .await
                .map_err(|_| AdmitError::Timeout),
            None => Ok(controller.acquire_owned().await),
        }
    })
}

impl<S> AdmissionService<S> {
    pub fn new(inner: S, controller: Arc<RateLimitController>) -> Self {
        Self {
            inner,
            controller,
            acquire: None,
            permit: None,
            fail_fast: false,
            timeout: None,
            wait_start: None,
            instruments: AdmissionServiceMetrics::new(),
        }
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn controller(&self) -> &Arc<RateLimitController> {
        &self.controller
    }

    fn admitted(&mut self, permit: OwnedAdmissionPermit, waited: Duration) {
        self.instruments.admitted.add(1, &[]);
        self.instruments.wait.record(waited.as_secs_f64(), &[]);
        self.permit = Some(permit);
    }

    fn rejected(&self, err: AdmitError) -> BoxError {
        debug!(%err, "admission refused");
        self.instruments.reject(&err);
        Box::new(err)
    }
}
