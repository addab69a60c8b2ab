//! Cooperative cancellation signal.
//!
//! A [`Cancellation`] is shared between whoever wants to stop some work and the
//! work itself. Requesting cancellation never interrupts anything by force; the
//! observing side decides how and when to react, either by checking the flag or
//! by awaiting [`Cancellation::cancelled`].
use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll, Waker},
};

use crate::Cancelled;

struct Inner {
    cancelled: AtomicBool,
    next_key: AtomicU64,
    // One entry per live, pending `WaitForCancellation`.
    waiters: Mutex<HashMap<u64, Waker>>,
}

/// A cloneable handle for requesting and observing cancellation.
///
/// All clones refer to the same signal. Once cancelled, a `Cancellation` stays
/// cancelled forever.
#[derive(Clone)]
pub struct Cancellation {
    inner: Arc<Inner>,
}

impl Cancellation {
    /// Creates a new signal that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                next_key: AtomicU64::new(0),
                waiters: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Requests cancellation and wakes everything waiting on [`cancelled`].
    ///
    /// Calling this more than once has no further effect.
    ///
    /// [`cancelled`]: Cancellation::cancelled
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::trace!("cancellation requested");
        let waiters = std::mem::take(&mut *self.inner.waiters.lock().unwrap());
        for waker in waiters.into_values() {
            waker.wake();
        }
    }

    /// Returns `true` if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Returns `Err(Cancelled)` if cancellation has been requested.
    ///
    /// Handy inside envelopes: `token.check()?;`.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Returns a future that resolves once cancellation has been requested.
    pub fn cancelled(&self) -> WaitForCancellation {
        WaitForCancellation {
            cancellation: self.clone(),
            key: None,
        }
    }

    /// Runs `future` until it completes or cancellation is requested,
    /// whichever happens first.
    ///
    /// Cancellation wins ties, so an already cancelled signal never polls
    /// `future` at all.
    pub async fn run_until_cancelled<F: Future>(&self, future: F) -> Result<F::Output, Cancelled> {
        let future = std::pin::pin!(future);
        let cancelled = self.cancelled();
        match futures::future::select(cancelled, future).await {
            futures::future::Either::Left(((), _)) => Err(Cancelled),
            futures::future::Either::Right((output, _)) => Ok(output),
        }
    }

    fn register(&self, key: &mut Option<u64>, waker: &Waker) {
        let key = *key.get_or_insert_with(|| self.inner.next_key.fetch_add(1, Ordering::Relaxed));
        let mut waiters = self.inner.waiters.lock().unwrap();
        match waiters.get_mut(&key) {
            Some(registered) if registered.will_wake(waker) => {}
            Some(registered) => registered.clone_from(waker),
            None => {
                waiters.insert(key, waker.clone());
            }
        }
    }

    fn deregister(&self, key: &mut Option<u64>) {
        if let Some(key) = key.take() {
            self.inner.waiters.lock().unwrap().remove(&key);
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancellation")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Future returned by [`Cancellation::cancelled`].
///
/// Dropping it withdraws its registration from the signal.
#[must_use = "futures do nothing unless polled or .awaited"]
pub struct WaitForCancellation {
    cancellation: Cancellation,
    key: Option<u64>,
}

impl Future for WaitForCancellation {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.cancellation.is_cancelled() {
            this.cancellation.deregister(&mut this.key);
            return Poll::Ready(());
        }
        this.cancellation.register(&mut this.key, cx.waker());
        // `cancel` may have drained the waiters between the check and the registration.
        if this.cancellation.is_cancelled() {
            this.cancellation.deregister(&mut this.key);
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

impl Drop for WaitForCancellation {
    fn drop(&mut self) {
        self.cancellation.deregister(&mut self.key);
    }
}
