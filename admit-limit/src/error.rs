use crate::AdmissionId;

/// Errors raised by the admission core.
///
/// `CapacityExceeded` and `UnknownRelease` describe broken admission/release
/// pairing. The suspending API treats them as fatal and panics with their
/// `Display` output; only [`RateLimitController::try_end_admission`] hands
/// one back as a value.
///
/// [`RateLimitController::try_end_admission`]: crate::RateLimitController::try_end_admission
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    /// More admissions are in flight than the controller's rate allows.
    #[error("{in_flight} admissions in flight exceeds the configured rate of {rate}")]
    CapacityExceeded { in_flight: usize, rate: usize },

    /// A release named an admission that is not in flight.
    ///
    /// Releasing the same admission twice lands here too.
    #[error("no in-flight admission with id {id}")]
    UnknownRelease { id: AdmissionId },

    /// A [`ResourceScheduler`](crate::ResourceScheduler) was built without resources.
    #[error("a resource scheduler needs at least one resource")]
    NoResources,
}
