use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tower::BoxError;
use tower::Service;
use tower::ServiceExt;
use tracing::warn;

use crate::retry_policy::RetryPolicy;

/// Retries failed calls of the inner service according to a [`RetryPolicy`].
///
/// Every attempt waits for the inner service to become ready before calling
/// it, so an [`AdmissionService`](crate::AdmissionService) underneath acquires
/// a fresh admission for each attempt. Errors raised while waiting for
/// readiness are returned as they are.
#[derive(Clone, Debug)]
pub struct RetryService<S> {
    inner: S,
    policy: RetryPolicy,
    retries: Counter<u64>,
}

impl<S> RetryService<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        let meter = global::meter("retry_service");
        Self {
            inner,
            policy,
            retries: meter.u64_counter("retries").build(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl<S, Req> Service<Req> for RetryService<S>
where
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: 'static,
    Req: Clone + Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness is checked per attempt inside the response future
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let policy = self.policy.clone();
        let retries = self.retries.clone();

        Box::pin(async move {
            let mut attempt = 1;
            loop {
                // Rejections while waiting for readiness are not retried
                let svc = match inner.ready().await {
                    Ok(svc) => svc,
                    Err(err) => return Err(err),
                };
                let err = match svc.call(req.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(err) => err,
                };

                if attempt >= policy.max_attempts() || !policy.is_retryable(&err) {
                    return Err(err);
                }

                let delay = policy.delay_for(attempt - 1);
                warn!(
                    %err,
                    attempt,
                    max_attempts = policy.max_attempts(),
                    ?delay,
                    "attempt failed, retrying"
                );
                retries.add(1, &[]);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        })
    }
}
