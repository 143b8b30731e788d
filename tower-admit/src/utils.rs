use std::sync::Arc;

use admit_limit::RateLimitController;
use tower::BoxError;
use tower::Service;
use tower::ServiceBuilder;
use tower::layer::util::Stack;
use tower::util::BoxCloneService;

use crate::AdmissionLayer;
use crate::RetryLayer;
use crate::RetryPolicy;

/// Run every call of `svc` under an admission from `controller`, waiting as
/// long as it takes.
pub fn make_admission_svc<V, Req, Resp>(
    controller: Arc<RateLimitController>,
    svc: V,
) -> BoxCloneService<Req, Resp, BoxError>
where
    Req: Send + 'static,
    V: Service<Req, Response = Resp, Error = BoxError> + Clone + Send + 'static,
    <V as Service<Req>>::Future: Send + 'static,
{
    BoxCloneService::new(
        ServiceBuilder::new()
            .layer(AdmissionLayer::new(controller))
            .service(svc),
    )
}

/// Retry calls of `svc` according to `policy`, with every attempt admitted
/// separately by `controller`.
pub fn make_retrying_svc<V, Req, Resp>(
    controller: Arc<RateLimitController>,
    policy: RetryPolicy,
    svc: V,
) -> BoxCloneService<Req, Resp, BoxError>
where
    Req: Clone + Send + 'static,
    Resp: 'static,
    V: Service<Req, Response = Resp, Error = BoxError> + Clone + Send + 'static,
    <V as Service<Req>>::Future: Send + 'static,
{
    BoxCloneService::new(
        ServiceBuilder::new()
            .layer(RetryLayer::new(policy))
            .layer(AdmissionLayer::new(controller))
            .service(svc),
    )
}

/// Service Builder Extension with admission functions for tower::ServiceBuilder.
pub trait ServiceBuilderExt<L> {
    /// Add an admission layer
    fn admission(
        self,
        controller: Arc<RateLimitController>,
    ) -> ServiceBuilder<Stack<AdmissionLayer, L>>;

    /// Add a retry layer with an admission layer beneath it
    fn retrying_admission(
        self,
        policy: RetryPolicy,
        controller: Arc<RateLimitController>,
    ) -> ServiceBuilder<Stack<AdmissionLayer, Stack<RetryLayer, L>>>;
}

impl<L> ServiceBuilderExt<L> for ServiceBuilder<L> {
    fn admission(
        self,
        controller: Arc<RateLimitController>,
    ) -> ServiceBuilder<Stack<AdmissionLayer, L>> {
        self.layer(AdmissionLayer::new(controller))
    }

    fn retrying_admission(
        self,
        policy: RetryPolicy,
        controller: Arc<RateLimitController>,
    ) -> ServiceBuilder<Stack<AdmissionLayer, Stack<RetryLayer, L>>> {
        self.layer(RetryLayer::new(policy))
            .layer(AdmissionLayer::new(controller))
    }
}
