use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// An asynchronous FIFO handoff between producers and waiters.
///
/// Values and waiters are paired by arrival order on each side, not by
/// causality. Both sides may hold entries at the same time: a value pushed
/// while nobody waits stays pending, and a later `get` still registers and
/// waits for the *next* push. That makes the queue a condition-variable
/// substitute for fungible signals, not a channel for payloads.
#[derive(Debug)]
pub struct WaitQueue<T> {
    inner: Mutex<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    values: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WaitQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                values: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Appends `value` and, if anyone is waiting, hands the oldest pending
    /// value to the oldest waiter.
    ///
    /// Waiters that were dropped before delivery are skipped.
    pub fn push(&self, value: T) {
        let mut inner = self.inner.lock();
        inner.values.push_back(value);

        while let Some(waiter) = inner.waiters.pop_front() {
            let Some(value) = inner.values.pop_front() else {
                inner.waiters.push_front(waiter);
                return;
            };
            match waiter.send(value) {
                Ok(()) => return,
                Err(value) => inner.values.push_front(value),
            }
        }
    }

    /// Registers a waiter at the back of the queue.
    ///
    /// Registration happens here, not on first poll of the returned future.
    /// A caller can therefore register while holding its own lock and await
    /// after releasing it without missing a push in between.
    pub fn get(&self) -> Waiter<'_, T> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        // Waiters dropped before any push would otherwise pile up
        inner.waiters.retain(|waiter| !waiter.is_closed());
        inner.waiters.push_back(tx);
        drop(inner);
        Waiter { queue: self, rx }
    }

    /// Number of pushed values no waiter has claimed yet.
    pub fn pending_values(&self) -> usize {
        self.inner.lock().values.len()
    }

    /// Number of registered waiters still waiting for a value.
    pub fn pending_waiters(&self) -> usize {
        self.inner
            .lock()
            .waiters
            .iter()
            .filter(|waiter| !waiter.is_closed())
            .count()
    }
}

/// Future returned by [`WaitQueue::get`].
///
/// Dropping a waiter that was handed a value it never observed pushes that
/// value back into the queue, so the signal reaches the next waiter instead
/// of being lost.
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Waiter<'a, T> {
    queue: &'a WaitQueue<T>,
    rx: oneshot::Receiver<T>,
}

impl<T> Future for Waiter<'_, T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(value),
            // The sender only disappears together with the queue, which this
            // waiter borrows, so there is nothing left to wait for.
            Poll::Ready(Err(_)) | Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        if let Ok(value) = self.rx.try_recv() {
            self.queue.push(value);
        }
    }
}
