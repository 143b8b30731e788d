/// Errors produced by the admission middleware.
///
/// Errors of the wrapped service are never converted into `AdmitError`; they
/// pass through untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmitError {
    /// Admission was not granted within the configured wait.
    #[error("Request timed out waiting for admission")]
    Timeout,

    /// Every admission slot is in flight and the layer is set to fail fast.
    #[error("All admission slots are in flight; request shed")]
    Overloaded,

    /// The rolling window is full and the layer is set to fail fast.
    ///
    /// The duration indicates when the window will have room again.
    #[error("Rate limit exceeded; retry after {retry_after:?}")]
    RateLimited {
        /// The duration to wait before retrying.
        retry_after: std::time::Duration,
    },
}

impl From<admit_limit::Reason> for AdmitError {
    fn from(reason: admit_limit::Reason) -> Self {
        match reason {
            admit_limit::Reason::AtCapacity => Self::Overloaded,
            admit_limit::Reason::Overloaded { retry_after } => Self::RateLimited { retry_after },
        }
    }
}
