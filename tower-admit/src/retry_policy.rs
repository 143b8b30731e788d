use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tower::BoxError;

type Predicate = Arc<dyn Fn(&BoxError) -> bool + Send + Sync>;

const DEFAULT_MAX_ATTEMPTS: NonZeroUsize = NonZeroUsize::new(10).unwrap();

/// How a [`RetryService`](crate::RetryService) retries failed requests.
///
/// The delay before retry `n` (counting from zero) is
/// `initial_delay * multiplier^n`, capped at `max_delay` when one is set.
/// The defaults are 10 attempts, a 1s initial delay, a multiplier of 2 and
/// no cap, retrying every error.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: NonZeroUsize,
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Option<Duration>,
    retryable: Predicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: None,
            retryable: Arc::new(|_| true),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("multiplier", &self.multiplier)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Create a policy making at most `max_attempts` attempts in total.
    pub fn new(max_attempts: NonZeroUsize) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// # Panics
    ///
    /// Panics if `multiplier` is negative or not finite.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        assert!(
            multiplier.is_finite() && multiplier >= 0.0,
            "backoff multiplier must be finite and non-negative, got {multiplier}"
        );
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Only retry errors for which `predicate` returns `true`.
    ///
    /// Other errors are returned to the caller after the first attempt.
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&BoxError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts.get()
    }

    pub fn is_retryable(&self, err: &BoxError) -> bool {
        (self.retryable)(err)
    }

    /// Delay before retry number `retry`, counting from zero.
    pub fn delay_for(&self, retry: usize) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}
