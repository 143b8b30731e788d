use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::time::Instant;
use tokio::time::sleep;
use tracing::debug;
use tracing::error;
use tracing::trace;

use crate::AdmissionPermit;
use crate::ControllerError;
use crate::OwnedAdmissionPermit;
use crate::Reason;
use crate::WaitQueue;
use crate::Waiter;

/// Identifies one admission granted by a [`RateLimitController`].
///
/// Ids are issued in strictly increasing admission order and are never
/// reused by the same controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AdmissionId(u64);

impl AdmissionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AdmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug)]
struct AdmissionRecord {
    id: AdmissionId,
    start: Instant,
    in_flight: bool,
}

#[derive(Debug)]
struct State {
    /// Admission log, oldest first
    records: VecDeque<AdmissionRecord>,
    next_id: u64,
    rng: StdRng,
}

impl State {
    fn in_flight(&self) -> usize {
        self.records.iter().filter(|record| record.in_flight).count()
    }

    /// Forgets released admissions that started more than `horizon` ago.
    fn prune(&mut self, now: Instant, horizon: Duration) {
        self.records.retain(|record| {
            record.in_flight || now.saturating_duration_since(record.start) <= horizon
        });
    }

    /// Start of the admission `rate` places back from the newest one, if the
    /// log is that long. No new admission may start within `interval` of it.
    fn window_reference(&self, rate: usize) -> Option<Instant> {
        let index = self.records.len().checked_sub(rate)?;
        self.records.get(index).map(|record| record.start)
    }

    fn sample_jitter(&mut self, jitter: Duration) -> Duration {
        if jitter.is_zero() {
            Duration::ZERO
        } else {
            self.rng.random_range(Duration::ZERO..jitter)
        }
    }

    fn admit(&mut self, now: Instant) -> AdmissionId {
        let id = AdmissionId(self.next_id);
        self.next_id += 1;
        self.records.push_back(AdmissionRecord {
            id,
            start: now,
            in_flight: true,
        });
        id
    }
}

/// A release signal taken off the wait queue by a caller that has not been
/// admitted yet. It goes back to the queue if the caller gives up.
struct HeldSignal<'a> {
    signal: &'a WaitQueue<()>,
    held: bool,
}

impl Drop for HeldSignal<'_> {
    fn drop(&mut self) {
        if self.held {
            trace!("admission abandoned, passing the release signal on");
            self.signal.push(());
        }
    }
}

enum Pass<'a> {
    Admitted(AdmissionId),
    Signal(Waiter<'a, ()>),
    Sleep(Duration),
}

/// An admission gate combining a concurrency cap with a rolling window.
///
/// At most `rate` admissions are in flight at once, and at most `rate`
/// admissions start within any `interval`. Callers that have to wait for the
/// window also wait for a random extra delay below `jitter`, which keeps a
/// crowd of blocked callers from waking in lockstep.
///
/// A controller is shared by reference or through an `Arc`; all state lives
/// behind one mutex that is never held across an `.await`.
#[derive(Debug)]
pub struct RateLimitController {
    rate: usize,
    interval: Duration,
    jitter: Duration,
    state: Mutex<State>,
    signal: WaitQueue<()>,
}

impl RateLimitController {
    /// Creates a controller admitting at most `rate` units of work at once
    /// and at most `rate` starts per `interval`.
    pub fn new(rate: NonZeroUsize, interval: Duration) -> Self {
        Self {
            rate: rate.get(),
            interval,
            jitter: Duration::ZERO,
            state: Mutex::new(State {
                records: VecDeque::new(),
                next_id: 0,
                rng: StdRng::from_os_rng(),
            }),
            signal: WaitQueue::new(),
        }
    }

    /// Sets the upper bound (exclusive) of the random delay added whenever a
    /// caller has to wait for the rolling window.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Seeds the jitter source, making the delays reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.state.get_mut().rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn rate(&self) -> usize {
        self.rate
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn jitter(&self) -> Duration {
        self.jitter
    }

    /// Admissions granted and not yet released.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight()
    }

    /// Total admissions granted since construction.
    pub fn admitted(&self) -> u64 {
        self.state.lock().next_id
    }

    /// Callers currently suspended until an in-flight admission is released.
    pub fn waiting(&self) -> usize {
        self.signal.pending_waiters()
    }

    /// Waits until both limits allow another start, then records it.
    ///
    /// Every pass re-evaluates the concurrency cap and the window, because
    /// releases and the passage of time change the answer between checks.
    /// Wake-ups are handed out in FIFO order, but a woken caller still has to
    /// pass both checks, so admission order is only biased towards FIFO.
    ///
    /// Dropping the returned future abandons the attempt without side
    /// effects on other callers. A release signal it already consumed is
    /// handed to the next waiter.
    ///
    /// # Panics
    ///
    /// Panics if more admissions are in flight than the rate allows, which
    /// can only follow from broken admission/release pairing.
    pub async fn begin_admission(&self) -> AdmissionId {
        // Set after a timed wait: the window delay already carries its jitter
        let mut settled = false;
        let mut wake = HeldSignal {
            signal: &self.signal,
            held: false,
        };

        loop {
            match self.pass(settled) {
                Pass::Admitted(id) => {
                    wake.held = false;
                    return id;
                }
                Pass::Signal(waiter) => {
                    trace!("waiting for an in-flight admission to be released");
                    // Back at capacity: the slot the signal announced is taken
                    wake.held = false;
                    settled = false;
                    waiter.await;
                    wake.held = true;
                }
                Pass::Sleep(delay) => {
                    trace!(?delay, "waiting for the rolling window");
                    settled = true;
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }
    }

    fn pass(&self, settled: bool) -> Pass<'_> {
        let mut state = self.state.lock();
        let in_flight = state.in_flight();
        self.check_capacity(in_flight);

        if in_flight >= self.rate {
            // Registered under the state lock so a release cannot slip in
            // between the check and the wait.
            return Pass::Signal(self.signal.get());
        }

        let now = Instant::now();
        state.prune(now, self.interval + self.jitter);

        let Some(reference) = state.window_reference(self.rate) else {
            return Pass::Admitted(self.grant(&mut state, now, in_flight));
        };

        let delay = (reference + self.interval).saturating_duration_since(now);
        if settled && delay.is_zero() {
            return Pass::Admitted(self.grant(&mut state, now, in_flight));
        }

        Pass::Sleep(delay + state.sample_jitter(self.jitter))
    }

    /// Admits immediately if both limits allow it, without waiting.
    ///
    /// No jitter is applied. When the window is full, `retry_after` is the
    /// time until its oldest limiting admission leaves it.
    pub fn try_begin_admission(&self) -> ControlFlow<Reason, AdmissionId> {
        let mut state = self.state.lock();
        let in_flight = state.in_flight();
        self.check_capacity(in_flight);

        if in_flight >= self.rate {
            return ControlFlow::Break(Reason::AtCapacity);
        }

        let now = Instant::now();
        state.prune(now, self.interval + self.jitter);

        if let Some(reference) = state.window_reference(self.rate) {
            let retry_after = (reference + self.interval).saturating_duration_since(now);
            if !retry_after.is_zero() {
                return ControlFlow::Break(Reason::Overloaded { retry_after });
            }
        }

        ControlFlow::Continue(self.grant(&mut state, now, in_flight))
    }

    fn grant(&self, state: &mut State, now: Instant, in_flight: usize) -> AdmissionId {
        let id = state.admit(now);
        debug!(id = id.get(), in_flight = in_flight + 1, "admission granted");
        id
    }

    fn check_capacity(&self, in_flight: usize) {
        if in_flight > self.rate {
            let err = ControllerError::CapacityExceeded {
                in_flight,
                rate: self.rate,
            };
            error!(%err, "admission invariant violated");
            panic!("{err}");
        }
    }

    /// Releases an admission and wakes at most one suspended caller.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not in flight, including when it was already
    /// released.
    pub fn end_admission(&self, id: AdmissionId) {
        if let Err(err) = self.try_end_admission(id) {
            error!(%err, "admission invariant violated");
            panic!("{err}");
        }
    }

    /// Releases an admission, reporting an unknown or already released `id`
    /// instead of panicking.
    pub fn try_end_admission(&self, id: AdmissionId) -> Result<(), ControllerError> {
        {
            let mut state = self.state.lock();
            let record = state
                .records
                .iter_mut()
                .find(|record| record.id == id && record.in_flight)
                .ok_or(ControllerError::UnknownRelease { id })?;
            record.in_flight = false;
        }
        debug!(id = id.get(), "admission released");
        self.signal.push(());
        Ok(())
    }

    /// Waits for an admission that is released when the permit drops.
    pub async fn acquire(&self) -> AdmissionPermit<'_> {
        let id = self.begin_admission().await;
        AdmissionPermit::new(self, id)
    }

    /// Like [`acquire`](Self::acquire), but the permit owns a handle to the
    /// controller.
    pub async fn acquire_owned(self: Arc<Self>) -> OwnedAdmissionPermit {
        let id = self.begin_admission().await;
        OwnedAdmissionPermit::new(self, id)
    }

    pub fn try_acquire(&self) -> Result<AdmissionPermit<'_>, Reason> {
        match self.try_begin_admission() {
            ControlFlow::Continue(id) => Ok(AdmissionPermit::new(self, id)),
            ControlFlow::Break(reason) => Err(reason),
        }
    }

    pub fn try_acquire_owned(self: &Arc<Self>) -> Result<OwnedAdmissionPermit, Reason> {
        match self.try_begin_admission() {
            ControlFlow::Continue(id) => Ok(OwnedAdmissionPermit::new(Arc::clone(self), id)),
            ControlFlow::Break(reason) => Err(reason),
        }
    }

    /// Runs `work` under an admission.
    ///
    /// The admission is released once `work` completes, whatever its
    /// output, and also if the returned future is dropped early.
    pub async fn run<F, Fut>(&self, work: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let _permit = self.acquire().await;
        work().await
    }

    #[cfg(test)]
    pub(crate) fn retained(&self) -> usize {
        self.state.lock().records.len()
    }
}
