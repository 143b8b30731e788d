//! # admit-limit
//!
//! `admit-limit` throttles a pool of concurrent asynchronous operations.
//!
//! A [`RateLimitController`] enforces two limits at once:
//!
//! * **Concurrency**: at most `rate` admissions are in flight at any moment.
//! * **Rolling window**: at most `rate` admissions *start* within any
//!   `interval`, with an optional random `jitter` added to every wait so that
//!   blocked callers do not wake in lockstep.
//!
//! Callers that cannot start yet are suspended rather than rejected. They wait
//! either on a [`WaitQueue`] of release signals or on a timer, and re-check both
//! limits every time they wake.
//!
//! ## Example
//!
//! ```rust
//! use std::num::NonZeroUsize;
//! use std::time::Duration;
//!
//! use admit_limit::RateLimitController;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let rate = NonZeroUsize::new(5).unwrap();
//! let controller = RateLimitController::new(rate, Duration::from_millis(1200))
//!     .with_jitter(Duration::from_millis(300));
//!
//! let answer = controller.run(|| async { 42 }).await;
//! assert_eq!(answer, 42);
//! assert_eq!(controller.in_flight(), 0);
//! # }
//! ```

use std::time::Duration;

mod controller;
mod error;
mod permit;
mod scheduler;
mod wait_queue;

pub use controller::AdmissionId;
pub use controller::RateLimitController;
pub use error::ControllerError;
pub use permit::AdmissionPermit;
pub use permit::OwnedAdmissionPermit;
pub use scheduler::ResourceScheduler;
pub use scheduler::ScheduledPermit;
pub use wait_queue::WaitQueue;
pub use wait_queue::Waiter;

/// Reasons why a non-blocking admission attempt might be refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// Every slot is in flight. Only a release can make room.
    AtCapacity,
    /// The rolling window is full until `retry_after` has passed.
    Overloaded { retry_after: Duration },
}
