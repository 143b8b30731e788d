use std::sync::Arc;
use std::time::Duration;

use admit_limit::RateLimitController;
use tower::Layer;

use crate::service::AdmissionService;

/// Runs requests under admissions from a shared [`RateLimitController`].
///
/// Every service produced by the layer shares the same controller, so the
/// limits apply across all of them.
#[derive(Clone, Debug)]
pub struct AdmissionLayer {
    controller: Arc<RateLimitController>,
    fail_fast: bool,
    timeout: Option<Duration>,
}

impl AdmissionLayer {
    /// Create an AdmissionLayer
    pub fn new(controller: Arc<RateLimitController>) -> Self {
        AdmissionLayer {
            controller,
            fail_fast: false,
            timeout: None,
        }
    }

    /// Set whether the service should fail immediately instead of waiting.
    ///
    /// If `true`, `poll_ready` returns `AdmitError::Overloaded` when every
    /// slot is in flight and `AdmitError::RateLimited` when the window is
    /// full.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Bound the time spent waiting for admission.
    ///
    /// If admission is not granted in time, the service returns
    /// `AdmitError::Timeout`. The inner call itself is not bounded.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, service: S) -> Self::Service {
        let mut svc = AdmissionService::new(service, Arc::clone(&self.controller))
            .with_fail_fast(self.fail_fast);
        if let Some(timeout) = self.timeout {
            svc = svc.with_timeout(timeout);
        }
        svc
    }
}
