//! Reordering of independent futures into real completion order.
//!
//! [`order_by_completion`] takes `N` independent futures and returns `N`
//! [`Completion`]s. The `i`-th completion resolves with the output of whichever
//! source was the `i`-th to finish, regardless of where that source sat in the
//! input.
//!
//! Every output position is backed by a pre-created one-shot slot. A source that
//! finishes claims the next free position with a single atomic increment and
//! deposits its outcome there, so no two sources ever write the same slot and
//! simultaneous completions still receive distinct ranks.
//!
//! The sources are not spawned anywhere. Whichever [`Completion`] is being
//! polled drives all outstanding sources through one shared driver, which keeps
//! the reorderer independent of any particular executor. Futures that already
//! run elsewhere (e.g. join handles) are merely observed.
//!
//! A source that panics is treated like a failed operation: the panic is caught
//! where it happens, claims a slot like any other outcome, and is resumed only on
//! the task that awaits that specific [`Completion`].
use std::{
    any::Any,
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll, Waker, ready},
};

use futures::{
    FutureExt, Stream, StreamExt,
    channel::oneshot,
    future::CatchUnwind,
    stream::{FusedStream, FuturesUnordered},
    task::{ArcWake, waker_ref},
};
use pin_project_lite::pin_project;

use crate::{Cancellation, Cancelled, cancellation::WaitForCancellation};

type Outcome<T> = Result<T, Box<dyn Any + Send>>;

// Pre-created output positions plus the counter that hands them out.
struct Slots<T> {
    next: AtomicUsize,
    senders: Vec<Mutex<Option<oneshot::Sender<Outcome<T>>>>>,
}

impl<T> Slots<T> {
    fn claim(&self, outcome: Outcome<T>) {
        let rank = self.next.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(rank, failed = outcome.is_err(), "completion claimed slot");
        let sender = self.senders[rank].lock().unwrap().take();
        if let Some(sender) = sender {
            // The receiving `Completion` may have been dropped already.
            let _ = sender.send(outcome);
        }
    }
}

pin_project! {
    // Observes one source and writes its outcome into the next free slot.
    struct Claim<F>
    where
        F: Future,
    {
        #[pin]
        future: CatchUnwind<AssertUnwindSafe<F>>,
        slots: Arc<Slots<F::Output>>,
    }
}

impl<F: Future> Future for Claim<F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let outcome = ready!(this.future.poll(cx));
        this.slots.claim(outcome);
        Poll::Ready(())
    }
}

// Fans a single wake-up out to every `Completion` currently waiting on the driver.
struct Waiters {
    wakers: Mutex<Vec<Waker>>,
}

impl Waiters {
    fn register(&self, waker: &Waker) {
        let mut wakers = self.wakers.lock().unwrap();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }
}

impl ArcWake for Waiters {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let wakers = std::mem::take(&mut *arc_self.wakers.lock().unwrap());
        for waker in wakers {
            waker.wake();
        }
    }
}

struct Driver<F: Future> {
    pending: Mutex<FuturesUnordered<Claim<F>>>,
    waiters: Arc<Waiters>,
}

impl<F: Future> Driver<F> {
    // Polls every outstanding source that is ready to make progress.
    fn drive(&self, cx: &mut Context<'_>) {
        self.waiters.register(cx.waker());
        // Whoever holds the lock is already driving and wakes all waiters on progress.
        let Ok(mut pending) = self.pending.try_lock() else {
            return;
        };
        let waker = waker_ref(&self.waiters);
        let mut shared = Context::from_waker(&waker);
        while let Poll::Ready(Some(())) = pending.poll_next_unpin(&mut shared) {}
    }
}

enum State<F: Future> {
    Passthrough(Pin<Box<F>>),
    Slot {
        rank: usize,
        receiver: oneshot::Receiver<Outcome<F::Output>>,
        driver: Arc<Driver<F>>,
    },
    Resolved,
}

/// One output position of [`order_by_completion`].
///
/// Resolves with the outcome of the source that finished at this position's
/// rank. Failures carried in the output (e.g. `Err` values or cancelled join
/// handles) are returned as-is; a panicking source resumes its panic on the
/// task awaiting this `Completion`.
///
/// Polling a `Completion` again after it resolved panics.
#[must_use = "futures do nothing unless polled or .awaited"]
pub struct Completion<F: Future> {
    state: State<F>,
}

impl<F: Future> Completion<F> {
    /// The completion rank backing this output, or `None` when the source was
    /// passed through untouched (a batch of exactly one).
    pub fn rank(&self) -> Option<usize> {
        match &self.state {
            State::Slot { rank, .. } => Some(*rank),
            _ => None,
        }
    }

    /// Returns `true` if this output is the original source future itself.
    pub fn is_passthrough(&self) -> bool {
        matches!(self.state, State::Passthrough(_))
    }
}

impl<F: Future> Future for Completion<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = match &mut this.state {
            State::Passthrough(future) => {
                let output = ready!(future.as_mut().poll(cx));
                this.state = State::Resolved;
                return Poll::Ready(output);
            }
            State::Slot {
                receiver, driver, ..
            } => match receiver.poll_unpin(cx) {
                Poll::Ready(outcome) => outcome,
                Poll::Pending => {
                    driver.drive(cx);
                    ready!(receiver.poll_unpin(cx))
                }
            },
            State::Resolved => panic!("`Completion` polled after it resolved"),
        };
        this.state = State::Resolved;
        match outcome {
            Ok(Ok(output)) => Poll::Ready(output),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            // Senders live in the driver, which this completion keeps alive.
            Err(oneshot::Canceled) => unreachable!("completion slot dropped without an outcome"),
        }
    }
}

/// Reorders `sources` into the order in which they complete.
///
/// Returns exactly as many [`Completion`]s as there are sources. Batches of zero
/// or one source are returned unchanged, without any reordering machinery.
/// Construction never polls a source; the first poll of any returned completion
/// starts driving all of them.
///
/// # Example
/// ```
/// # use reflow::order_by_completion;
/// # futures::executor::block_on(async {
/// let (slow_tx, slow) = futures::channel::oneshot::channel::<&str>();
/// let (fast_tx, fast) = futures::channel::oneshot::channel::<&str>();
///
/// let mut ordered = order_by_completion([slow, fast]).into_iter();
/// let mut first = ordered.next().unwrap();
/// assert!(futures::poll!(&mut first).is_pending());
///
/// fast_tx.send("fast").unwrap();
/// slow_tx.send("slow").unwrap();
///
/// assert_eq!(first.await, Ok("fast"));
/// assert_eq!(ordered.next().unwrap().await, Ok("slow"));
/// # });
/// ```
pub fn order_by_completion<I>(sources: I) -> Vec<Completion<I::Item>>
where
    I: IntoIterator,
    I::Item: Future,
{
    let sources: Vec<_> = sources.into_iter().collect();
    if sources.len() < 2 {
        return sources
            .into_iter()
            .map(|source| Completion {
                state: State::Passthrough(Box::pin(source)),
            })
            .collect();
    }

    let count = sources.len();
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..count)
        .map(|_| {
            let (sender, receiver) = oneshot::channel();
            (Mutex::new(Some(sender)), receiver)
        })
        .unzip();
    let slots = Arc::new(Slots {
        next: AtomicUsize::new(0),
        senders,
    });
    let pending = sources
        .into_iter()
        .map(|source| Claim {
            future: AssertUnwindSafe(source).catch_unwind(),
            slots: Arc::clone(&slots),
        })
        .collect::<FuturesUnordered<_>>();
    let driver = Arc::new(Driver {
        pending: Mutex::new(pending),
        waiters: Arc::new(Waiters {
            wakers: Mutex::new(Vec::with_capacity(count)),
        }),
    });
    tracing::trace!(count, "reordering by completion");

    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, receiver)| Completion {
            state: State::Slot {
                rank,
                receiver,
                driver: Arc::clone(&driver),
            },
        })
        .collect()
}

/// Stream returned by [`in_completion_order`].
#[must_use = "streams do nothing unless polled"]
pub struct InCompletionOrder<F: Future> {
    completions: VecDeque<Completion<F>>,
    cancelled: WaitForCancellation,
    cancellation: Cancellation,
    terminated: bool,
}

impl<F: Future> InCompletionOrder<F> {
    fn terminate(&mut self) -> Cancelled {
        self.terminated = true;
        self.completions.clear();
        Cancelled
    }
}

impl<F: Future> Stream for InCompletionOrder<F> {
    type Item = Result<F::Output, Cancelled>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        if this.cancellation.is_cancelled() {
            return Poll::Ready(Some(Err(this.terminate())));
        }
        let Some(next) = this.completions.front_mut() else {
            this.terminated = true;
            return Poll::Ready(None);
        };
        if let Poll::Ready(output) = next.poll_unpin(cx) {
            this.completions.pop_front();
            return Poll::Ready(Some(Ok(output)));
        }
        if this.cancelled.poll_unpin(cx).is_ready() {
            return Poll::Ready(Some(Err(this.terminate())));
        }
        Poll::Pending
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.terminated {
            (0, Some(0))
        } else {
            (0, Some(self.completions.len() + 1))
        }
    }
}

impl<F: Future> FusedStream for InCompletionOrder<F> {
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// Yields the outputs of `sources` in real completion order.
///
/// Cancellation is checked before every item: once `cancellation` fires, the
/// stream yields a single `Err(Cancelled)` and ends.
pub fn in_completion_order<I>(sources: I, cancellation: Cancellation) -> InCompletionOrder<I::Item>
where
    I: IntoIterator,
    I::Item: Future,
{
    InCompletionOrder {
        completions: order_by_completion(sources).into(),
        cancelled: cancellation.cancelled(),
        cancellation,
        terminated: false,
    }
}
