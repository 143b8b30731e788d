//! # Tower Admit
//!
//! `tower-admit` puts the [`admit_limit::RateLimitController`] in front of
//! [Tower](https://github.com/tower-rs/tower) services.
//!
//! ## Layers
//!
//! - [`AdmissionLayer`] runs every call of the inner service under an
//!   admission. The admission is acquired in `poll_ready` and released as soon
//!   as the inner future finishes, successfully or not. It can wait without
//!   bound, wait up to a timeout (`AdmitError::Timeout`), or fail fast with
//!   `AdmitError::Overloaded` / `AdmitError::RateLimited`.
//! - [`RetryLayer`] retries failed calls with exponential backoff as described
//!   by a [`RetryPolicy`]. Placed outside an admission layer, every attempt
//!   is admitted on its own, so a failed attempt frees its slot before the
//!   backoff starts.
//!
//! [`ServiceBuilderExt::retrying_admission`] and [`make_retrying_svc`] compose
//! the two in that order.
//!
//! ```no_run
//! use std::num::NonZeroUsize;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use admit_limit::RateLimitController;
//! use tower::BoxError;
//! use tower::ServiceBuilder;
//! use tower::ServiceExt;
//! use tower_admit::RetryPolicy;
//! use tower_admit::ServiceBuilderExt;
//!
//! # async fn demo() -> Result<(), BoxError> {
//! let controller = Arc::new(RateLimitController::new(
//!     NonZeroUsize::new(5).unwrap(),
//!     Duration::from_secs(1),
//! ));
//!
//! let svc = ServiceBuilder::new()
//!     .retrying_admission(RetryPolicy::default(), controller)
//!     .service_fn(|name: &'static str| async move { Ok::<_, BoxError>(name.len()) });
//!
//! let len = svc.oneshot("hello").await?;
//! assert_eq!(len, 5);
//! # Ok(())
//! # }
//! ```

mod error;
mod layer;
mod retry_layer;
mod retry_policy;
mod retry_service;
mod service;
mod utils;


pub use error::AdmitError;
pub use layer::AdmissionLayer;
pub use retry_layer::RetryLayer;
pub use retry_policy::RetryPolicy;
pub use retry_service::RetryService;
pub use service::AdmissionService;
pub use service::ResponseFuture;
pub use utils::ServiceBuilderExt;
pub use utils::make_admission_svc;
pub use utils::make_retrying_svc;
