//! Shared background execution.
//!
//! The crate never owns a scheduler of its own. Work that has to keep running
//! while nobody polls it goes through a [`Spawner`], which by default hands the
//! future to a lazily created `futures` thread pool. Hosts that already run an
//! executor can plug it in instead, e.g. `Spawner::new(|f| { tokio::spawn(f); })`.

use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use futures::{
    executor::{ThreadPool, ThreadPoolBuilder},
    future::BoxFuture,
};

const POOL_SIZE: usize = 8;

static THREAD_POOL: OnceLock<ThreadPool> = OnceLock::new();

/// Returns the crate wide background pool, creating it on first use.
pub(crate) fn thread_pool() -> &'static ThreadPool {
    THREAD_POOL.get_or_init(|| {
        ThreadPoolBuilder::new()
            .pool_size(POOL_SIZE)
            .name_prefix("reflow-")
            .create()
            .expect("Thread pool creation failed")
    })
}

/// Runs a plain closure on the background pool.
pub(crate) fn run_detached(job: impl FnOnce() + Send + 'static) {
    thread_pool().spawn_ok(async move { job() });
}

/// Strategy used to run a future in the background.
///
/// Cloning a `Spawner` is cheap; all clones share the same strategy.
#[derive(Clone)]
pub struct Spawner {
    spawn: Arc<dyn Fn(BoxFuture<'static, ()>) + Send + Sync>,
}

impl Spawner {
    /// Creates a spawner from a closure that takes ownership of a boxed future
    /// and arranges for it to be polled to completion.
    pub fn new(spawn: impl Fn(BoxFuture<'static, ()>) + Send + Sync + 'static) -> Self {
        Self {
            spawn: Arc::new(spawn),
        }
    }

    /// Spawner backed by the crate's shared `futures` thread pool.
    ///
    /// Futures handed to this spawner must not depend on executor specific
    /// facilities, like `tokio::time::sleep()`, since no such runtime is
    /// active on the pool threads.
    pub fn thread_pool() -> Self {
        Self::new(|future| thread_pool().spawn_ok(future))
    }

    pub(crate) fn spawn(&self, future: BoxFuture<'static, ()>) {
        (self.spawn)(future)
    }
}

impl Default for Spawner {
    fn default() -> Self {
        Self::thread_pool()
    }
}

impl fmt::Debug for Spawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spawner").finish_non_exhaustive()
    }
}
