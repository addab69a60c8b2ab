//! Ambient scheduling context and how to get back to it.
//!
//! Every thread carries an optional *ambient* [`SchedulingContext`], the place
//! where code running on that thread considers itself to be scheduled. Arbitrary
//! asynchronous work may leave a different context behind (or none at all).
//! A [`ContextFlow`] snapshots the ambient context up front; awaiting it later
//! hops through the captured context and re-establishes it as ambient.
//!
//! ```
//! # use std::sync::Arc;
//! # use reflow::context::{self, ContextFlow, ThreadPoolContext};
//! # futures::executor::block_on(async {
//! let ui = context::set_current(None);
//! let flow = ContextFlow::snapshot();
//!
//! context::set_current(Some(Arc::new(ThreadPoolContext::default())));
//! // ... work that runs elsewhere ...
//!
//! flow.await;
//! assert!(context::current().is_none());
//! # drop(ui);
//! # });
//! ```
use std::{
    cell::RefCell,
    fmt,
    future::IntoFuture,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use futures::{executor::ThreadPool, task::AtomicWaker};

use crate::pool;

/// A unit of work posted to a [`SchedulingContext`].
pub type Job = Box<dyn FnOnce() + Send>;

/// A place continuations can be posted to.
///
/// Two contexts are considered the same if they are the same allocation.
pub trait SchedulingContext: Send + Sync + 'static {
    /// Runs `job` on this context, now or later.
    fn post(&self, job: Job);
}

/// Shared handle to a [`SchedulingContext`].
pub type ContextRef = Arc<dyn SchedulingContext>;

thread_local! {
    static AMBIENT: RefCell<Option<ContextRef>> = const { RefCell::new(None) };
}

/// Returns the ambient context of the current thread.
pub fn current() -> Option<ContextRef> {
    AMBIENT.with(|ambient| ambient.borrow().clone())
}

/// Sets the ambient context of the current thread, returning the previous one.
pub fn set_current(context: Option<ContextRef>) -> Option<ContextRef> {
    AMBIENT.with(|ambient| ambient.replace(context))
}

fn same(a: Option<&ContextRef>, b: Option<&ContextRef>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
        _ => false,
    }
}

/// A captured ambient context that can be awaited, any number of times, to
/// return to it.
///
/// Awaiting completes immediately if the captured context is already ambient.
/// Otherwise the wake-up is posted to the captured context, or to the shared
/// background pool if nothing was captured, and the captured context is made
/// ambient on the thread that resumes. This overwrites whatever context that
/// thread had, including replacing a context with "none".
#[derive(Clone)]
pub struct ContextFlow {
    context: Option<ContextRef>,
}

impl ContextFlow {
    /// Captures the current thread's ambient context (possibly none).
    #[must_use]
    pub fn snapshot() -> Self {
        Self { context: current() }
    }

    /// Targets `context` explicitly instead of the ambient one.
    #[must_use]
    pub fn on(context: Option<ContextRef>) -> Self {
        Self { context }
    }

    /// The captured context.
    pub fn context(&self) -> Option<&ContextRef> {
        self.context.as_ref()
    }

    /// Returns `true` if the captured context is ambient right now, meaning
    /// awaiting would complete without a hop.
    pub fn is_completed(&self) -> bool {
        AMBIENT.with(|ambient| same(ambient.borrow().as_ref(), self.context.as_ref()))
    }
}

impl fmt::Debug for ContextFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextFlow")
            .field("context", &self.context.as_ref().map(Arc::as_ptr))
            .finish()
    }
}

impl IntoFuture for ContextFlow {
    type Output = ();
    type IntoFuture = Restore;

    fn into_future(self) -> Self::IntoFuture {
        Restore {
            context: self.context,
            hop: None,
        }
    }
}

impl IntoFuture for &ContextFlow {
    type Output = ();
    type IntoFuture = Restore;

    fn into_future(self) -> Self::IntoFuture {
        self.clone().into_future()
    }
}

struct Hop {
    arrived: AtomicBool,
    waker: AtomicWaker,
}

/// Future that returns to the context captured by a [`ContextFlow`].
#[must_use = "futures do nothing unless polled or .awaited"]
pub struct Restore {
    context: Option<ContextRef>,
    hop: Option<Arc<Hop>>,
}

impl Restore {
    fn resume(&self) -> Poll<()> {
        set_current(self.context.clone());
        Poll::Ready(())
    }
}

impl Future for Restore {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(hop) = &self.hop {
            hop.waker.register(cx.waker());
            if hop.arrived.load(Ordering::Acquire) {
                return self.resume();
            }
            return Poll::Pending;
        }
        if AMBIENT.with(|ambient| same(ambient.borrow().as_ref(), self.context.as_ref())) {
            return Poll::Ready(());
        }

        let hop = Arc::new(Hop {
            arrived: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        });
        hop.waker.register(cx.waker());
        let remote = Arc::clone(&hop);
        let job: Job = Box::new(move || {
            remote.arrived.store(true, Ordering::Release);
            remote.waker.wake();
        });
        self.hop = Some(hop);
        tracing::trace!(captured = self.context.is_some(), "hopping back to captured context");
        match &self.context {
            Some(context) => context.post(job),
            None => pool::run_detached(job),
        }
        // The context may have run the job inline.
        match &self.hop {
            Some(hop) if hop.arrived.load(Ordering::Acquire) => self.resume(),
            _ => Poll::Pending,
        }
    }
}

/// A [`SchedulingContext`] that runs posted jobs on a `futures` thread pool.
#[derive(Clone)]
pub struct ThreadPoolContext {
    pool: ThreadPool,
}

impl ThreadPoolContext {
    /// Posts jobs to `pool`.
    pub fn new(pool: ThreadPool) -> Self {
        Self { pool }
    }
}

impl Default for ThreadPoolContext {
    /// Posts jobs to the crate's shared background pool.
    fn default() -> Self {
        Self::new(pool::thread_pool().clone())
    }
}

impl SchedulingContext for ThreadPoolContext {
    fn post(&self, job: Job) {
        self.pool.spawn_ok(async move { job() });
    }
}

impl fmt::Debug for ThreadPoolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolContext").finish_non_exhaustive()
    }
}
