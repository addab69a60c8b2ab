//! Adapts callback driven, long running operations into pull based streams.
//!
//! An *envelope* is a single long running operation that reports intermediate
//! items through a callback before it finally completes. [`EnvelopeStream`]
//! turns such an envelope into a [`Stream`] of `Result<T, E>`:
//!
//! - Items surface in exactly the order the envelope emitted them, no matter how
//!   many pile up between two pulls.
//! - A failure of the envelope surfaces at the pull that would otherwise have
//!   continued after the last queued item. A panic inside the envelope is
//!   caught on the background task and resumed on the consumer at that point.
//! - External cancellation stops the stream at the next pull. The stream then
//!   waits for the envelope according to its [`Envelope`] variant before it
//!   ends: cancellable envelopes are awaited, uncancellable ones are raced
//!   against the configured disposal timeout.
//!
//! The emitted items are buffered without bound until pulled.
use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use futures::{
    FutureExt, Stream,
    channel::oneshot,
    future::{self, BoxFuture, Either},
    stream::FusedStream,
    task::AtomicWaker,
};

use crate::{Cancellation, Spawner, cancellation::WaitForCancellation, timing::Sleep};

type Finished<E> = Result<Result<(), E>, Box<dyn Any + Send>>;

const LOST_TASK: &str = "envelope task was dropped before it completed";

type CancellableFn<T, E> =
    Box<dyn FnOnce(Emitter<T>, Cancellation) -> BoxFuture<'static, Result<(), E>> + Send>;
type UncancellableFn<T, E> = Box<dyn FnOnce(Emitter<T>) -> BoxFuture<'static, Result<(), E>> + Send>;

/// A long running operation that emits items through an [`Emitter`] before it
/// completes.
pub enum Envelope<T, E> {
    /// Receives a [`Cancellation`] it is expected to honor.
    Cancellable(CancellableFn<T, E>),
    /// An opaque operation without any notion of cancellation.
    Uncancellable(UncancellableFn<T, E>),
}

impl<T: 'static, E: 'static> Envelope<T, E> {
    /// Wraps an envelope that is handed the stream's cancellation signal.
    pub fn cancellable<G, Fut>(envelope: G) -> Self
    where
        G: FnOnce(Emitter<T>, Cancellation) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        Envelope::Cancellable(Box::new(move |emitter, cancellation| {
            envelope(emitter, cancellation).boxed()
        }))
    }

    /// Wraps an envelope that cannot be told to stop.
    ///
    /// Such an envelope may keep running in the background after the stream
    /// gave up on it, see [`EnvelopeStream::disposal_timeout`].
    pub fn uncancellable<G, Fut>(envelope: G) -> Self
    where
        G: FnOnce(Emitter<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        Envelope::Uncancellable(Box::new(move |emitter| envelope(emitter).boxed()))
    }
}

impl<T, E> Envelope<T, E> {
    /// Returns `true` for [`Envelope::Cancellable`].
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Envelope::Cancellable(_))
    }

    fn invoke(self, emitter: Emitter<T>, cancellation: Cancellation) -> BoxFuture<'static, Result<(), E>> {
        match self {
            Envelope::Cancellable(envelope) => envelope(emitter, cancellation),
            Envelope::Uncancellable(envelope) => envelope(emitter),
        }
    }
}

impl<T, E> fmt::Debug for Envelope<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Envelope::Cancellable(_) => f.write_str("Envelope::Cancellable"),
            Envelope::Uncancellable(_) => f.write_str("Envelope::Uncancellable"),
        }
    }
}

struct Channel<T> {
    queue: Mutex<VecDeque<T>>,
    signal: AtomicWaker,
    closed: AtomicBool,
}

/// Producer side handed to an envelope.
///
/// Emissions are expected to come from one logical producer at a time; items
/// emitted after the consuming stream went away are dropped.
pub struct Emitter<T> {
    channel: Arc<Channel<T>>,
}

impl<T> Emitter<T> {
    /// Queues `item` for the consumer and wakes it.
    pub fn emit(&self, item: T) {
        {
            let mut queue = self.channel.queue.lock().unwrap();
            // Checked under the lock so nothing lands after the stream cleared the queue.
            if self.channel.closed.load(Ordering::Acquire) {
                return;
            }
            queue.push_back(item);
        }
        self.channel.signal.wake();
    }

    /// Returns `true` once the consuming stream has ended or was dropped.
    pub fn is_closed(&self) -> bool {
        self.channel.closed.load(Ordering::Acquire)
    }
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
        }
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// How [`EnvelopeStream::dispose`] left the envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposal {
    /// The envelope completed (or never started).
    Completed,
    /// The disposal timeout elapsed first; the envelope keeps running
    /// unobserved in the background.
    Abandoned,
}

enum Phase<T, E> {
    Idle(Envelope<T, E>),
    Running,
    // Cancellation was noticed and the envelope has not completed yet.
    Draining(Option<Sleep>),
    Terminated,
}

/// A [`Stream`] over the items emitted by an [`Envelope`].
///
/// Nothing runs until the stream is first polled. From then on the envelope runs
/// as a background task through the configured [`Spawner`] (the crate's shared
/// thread pool by default), independently of how fast items are pulled.
///
/// After yielding an error, or after it ends, the stream only returns `None`.
/// Dropping the stream detaches the envelope; call [`dispose`] to wait for it.
///
/// # Panics
///
/// Polling resumes a panic raised inside the envelope. It also panics if the
/// envelope's background task is dropped before reporting an outcome, for
/// example because the runtime behind a custom [`Spawner`] shut down. Once
/// cancellation was noticed, either outcome is discarded like any other.
///
/// [`dispose`]: EnvelopeStream::dispose
///
/// # Example
/// ```
/// # use futures::StreamExt;
/// # use reflow::{Envelope, EnvelopeStream};
/// # futures::executor::block_on(async {
/// let envelope = Envelope::uncancellable(|emitter| async move {
///     for word in ["a", "b", "c"] {
///         emitter.emit(word);
///     }
///     Ok::<_, std::io::Error>(())
/// });
///
/// let items: Vec<_> = EnvelopeStream::new(envelope).collect().await;
/// let items: Vec<_> = items.into_iter().map(Result::unwrap).collect();
/// assert_eq!(items, ["a", "b", "c"]);
/// # });
/// ```
#[must_use = "streams do nothing unless polled"]
pub struct EnvelopeStream<T, E> {
    phase: Phase<T, E>,
    cancellable: bool,
    channel: Arc<Channel<T>>,
    done: Option<oneshot::Receiver<Finished<E>>>,
    finished: Option<Finished<E>>,
    cancellation: Option<Cancellation>,
    cancelled: Option<WaitForCancellation>,
    disposal_timeout: Option<Duration>,
    abandoned: bool,
    spawner: Spawner,
}

impl<T, E> EnvelopeStream<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Creates a stream over the items of `envelope`.
    pub fn new(envelope: Envelope<T, E>) -> Self {
        Self {
            cancellable: envelope.is_cancellable(),
            phase: Phase::Idle(envelope),
            channel: Arc::new(Channel {
                queue: Mutex::new(VecDeque::with_capacity(16)),
                signal: AtomicWaker::new(),
                closed: AtomicBool::new(false),
            }),
            done: None,
            finished: None,
            cancellation: None,
            cancelled: None,
            disposal_timeout: None,
            abandoned: false,
            spawner: Spawner::default(),
        }
    }

    /// Stops the stream once `cancellation` is requested.
    ///
    /// A cancellable envelope receives the same signal, so this must be set
    /// before the stream is first polled for the envelope to observe it.
    pub fn with_cancellation(&mut self, cancellation: Cancellation) -> &mut Self {
        if !matches!(self.phase, Phase::Idle(_)) {
            tracing::warn!("cancellation attached after the envelope started; the envelope will not see it");
        }
        self.cancelled = Some(cancellation.cancelled());
        self.cancellation = Some(cancellation);
        self
    }

    /// Bounds how long an [`Envelope::Uncancellable`] is waited for once
    /// cancellation was requested.
    ///
    /// When the timeout elapses first, the stream ends and the envelope is left
    /// running unobserved. Without a timeout the stream waits for the envelope
    /// to complete. Cancellable envelopes are always awaited.
    pub fn disposal_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.disposal_timeout = Some(timeout);
        self
    }

    /// Runs the envelope through `spawner` instead of the shared thread pool.
    pub fn spawn_with(&mut self, spawner: Spawner) -> &mut Self {
        self.spawner = spawner;
        self
    }

    /// Ends consumption and waits for the envelope according to the disposal
    /// rules: cancellable envelopes are awaited, uncancellable envelopes are
    /// awaited for at most the disposal timeout once cancellation was
    /// requested, and without cancellation the envelope is awaited until it
    /// completes on its own.
    pub async fn dispose(mut self) -> Disposal {
        self.close();
        if self.abandoned {
            return Disposal::Abandoned;
        }
        let Some(done) = self.done.take() else {
            return Disposal::Completed;
        };
        let cancelled = self.cancellation.as_ref().is_some_and(Cancellation::is_cancelled);
        let timeout = match std::mem::replace(&mut self.phase, Phase::Terminated) {
            Phase::Draining(sleep) => sleep,
            _ if cancelled && !self.cancellable => self.disposal_timeout.map(Sleep::new),
            _ => None,
        };
        match timeout {
            Some(sleep) => match future::select(done, sleep).await {
                Either::Left(_) => Disposal::Completed,
                Either::Right(_) => {
                    tracing::warn!("disposal timeout elapsed, leaving envelope running in the background");
                    Disposal::Abandoned
                }
            },
            None => {
                let _ = done.await;
                Disposal::Completed
            }
        }
    }

    fn start(&mut self, envelope: Envelope<T, E>) {
        let cancellation = self.cancellation.clone().unwrap_or_default();
        let emitter = Emitter {
            channel: Arc::clone(&self.channel),
        };
        let (sender, receiver) = oneshot::channel();
        let task = AssertUnwindSafe(async move { envelope.invoke(emitter, cancellation).await })
            .catch_unwind()
            .map(move |finished| {
                // The stream may be gone; nobody is left to observe the outcome.
                let _ = sender.send(finished);
            });
        tracing::debug!(cancellable = self.cancellable, "starting envelope");
        self.done = Some(receiver);
        self.spawner.spawn(task.boxed());
    }

    // Records the envelope's outcome if it completed, without waiting for it.
    fn observe_completion(&mut self, cx: &mut Context<'_>) -> bool {
        if self.finished.is_some() {
            return true;
        }
        let Some(done) = self.done.as_mut() else {
            return false;
        };
        let Poll::Ready(finished) = done.poll_unpin(cx) else {
            return false;
        };
        self.done = None;
        self.finished = Some(finished.unwrap_or_else(|oneshot::Canceled| {
            tracing::error!("envelope task was dropped before it completed");
            Err(Box::new(LOST_TASK) as Box<dyn Any + Send>)
        }));
        true
    }

    fn cancellation_requested(&self) -> bool {
        self.cancellation.as_ref().is_some_and(Cancellation::is_cancelled)
    }

    fn close(&mut self) {
        self.channel.closed.store(true, Ordering::Release);
    }

    fn terminate(&mut self) {
        self.phase = Phase::Terminated;
        self.close();
        self.channel.queue.lock().unwrap().clear();
    }

    // Converts a recorded outcome into the stream's final item.
    fn conclude(&mut self, finished: Finished<E>) -> Poll<Option<Result<T, E>>> {
        self.terminate();
        match finished {
            Ok(Ok(())) => {
                tracing::debug!("envelope completed");
                Poll::Ready(None)
            }
            Ok(Err(error)) => {
                tracing::debug!("envelope failed");
                Poll::Ready(Some(Err(error)))
            }
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<T, E>>> {
        if self.observe_completion(cx) {
            // Whatever the envelope returned in reaction to cancellation is discarded.
            tracing::debug!("envelope completed after cancellation");
            self.finished = None;
            self.terminate();
            return Poll::Ready(None);
        }
        if let Phase::Draining(Some(sleep)) = &mut self.phase {
            if sleep.poll_unpin(cx).is_ready() {
                tracing::warn!("disposal timeout elapsed, leaving envelope running in the background");
                self.done = None;
                self.abandoned = true;
                self.terminate();
                return Poll::Ready(None);
            }
        }
        Poll::Pending
    }
}

// No field is ever pinned; the envelope itself runs boxed on the spawner.
impl<T, E> Unpin for EnvelopeStream<T, E> {}

impl<T, E> Stream for EnvelopeStream<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match std::mem::replace(&mut this.phase, Phase::Running) {
                Phase::Terminated => {
                    this.phase = Phase::Terminated;
                    return Poll::Ready(None);
                }
                Phase::Idle(envelope) => this.start(envelope),
                draining @ Phase::Draining(_) => {
                    this.phase = draining;
                    return this.poll_drain(cx);
                }
                Phase::Running => {}
            }

            let completed = this.observe_completion(cx);
            if this.cancellation_requested() {
                tracing::debug!(completed, "cancellation noticed");
                match this.finished.take() {
                    // The envelope failed before cancellation was noticed.
                    Some(finished @ (Ok(Err(_)) | Err(_))) => return this.conclude(finished),
                    Some(Ok(Ok(()))) => return this.conclude(Ok(Ok(()))),
                    None => {}
                }
                let timeout = if this.cancellable {
                    None
                } else {
                    this.disposal_timeout.map(Sleep::new)
                };
                this.phase = Phase::Draining(timeout);
                this.close();
                this.channel.queue.lock().unwrap().clear();
                continue;
            }

            if let Some(item) = this.channel.queue.lock().unwrap().pop_front() {
                return Poll::Ready(Some(Ok(item)));
            }
            if let Some(finished) = this.finished.take() {
                return this.conclude(finished);
            }

            this.channel.signal.register(cx.waker());
            if let Some(cancelled) = this.cancelled.as_mut() {
                if cancelled.poll_unpin(cx).is_ready() {
                    continue;
                }
            }
            // An item may have been queued before the waker was registered.
            if !this.channel.queue.lock().unwrap().is_empty() {
                continue;
            }
            return Poll::Pending;
        }
    }
}

impl<T, E> FusedStream for EnvelopeStream<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn is_terminated(&self) -> bool {
        matches!(self.phase, Phase::Terminated)
    }
}

impl<T, E> Drop for EnvelopeStream<T, E> {
    fn drop(&mut self) {
        self.channel.closed.store(true, Ordering::Release);
    }
}

/// Creates an [`EnvelopeStream`] over the items of `envelope`.
pub fn from_envelope<T, E>(envelope: Envelope<T, E>) -> EnvelopeStream<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    EnvelopeStream::new(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{StreamExt, executor::block_on, task::noop_waker_ref};

    #[test]
    fn empty_envelope_ends_immediately() {
        let mut stream = from_envelope(Envelope::<u8, ()>::uncancellable(|_| async { Ok(()) }));
        assert_eq!(block_on(stream.next()), None);
        assert!(stream.is_terminated());
    }

    #[test]
    fn emitter_drops_items_after_stream_is_gone() {
        let (sender, receiver) = oneshot::channel();
        let mut stream = from_envelope(Envelope::<u8, ()>::uncancellable(move |emitter| async move {
            let _ = sender.send(emitter);
            Ok(())
        }));
        assert_eq!(block_on(stream.next()), None);
        let emitter = block_on(receiver).unwrap();
        assert!(emitter.is_closed());
        emitter.emit(1);
        drop(stream);
        assert!(emitter.channel.queue.lock().unwrap().is_empty());
    }

    #[test]
    fn dispose_before_start_completes() {
        let stream = from_envelope(Envelope::<u8, ()>::cancellable(|_, _| future::pending()));
        assert_eq!(block_on(stream.dispose()), Disposal::Completed);
    }

    #[test]
    fn variant_is_reported() {
        assert!(Envelope::<u8, ()>::cancellable(|_, _| async { Ok(()) }).is_cancellable());
        assert!(!Envelope::<u8, ()>::uncancellable(|_| async { Ok(()) }).is_cancellable());
    }

    #[test]
    fn emissions_racing_termination_are_not_buffered() {
        let cancellation = Cancellation::new();
        let (sender, receiver) = oneshot::channel();
        let mut stream = from_envelope(Envelope::<u32, ()>::cancellable(
            move |emitter, token: Cancellation| async move {
                let _ = sender.send(emitter);
                token.cancelled().await;
                Ok(())
            },
        ));
        stream.with_cancellation(cancellation.clone());
        let mut cx = Context::from_waker(noop_waker_ref());
        let _ = stream.poll_next_unpin(&mut cx);
        let emitter = block_on(receiver).unwrap();

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let emitter = emitter.clone();
                std::thread::spawn(move || {
                    for item in 0..20_000 {
                        emitter.emit(item);
                    }
                })
            })
            .collect();
        cancellation.cancel();
        while block_on(stream.next()).is_some() {}
        for producer in producers {
            producer.join().unwrap();
        }
        assert!(emitter.is_closed());
        assert!(emitter.channel.queue.lock().unwrap().is_empty());
    }

    #[test]
    #[should_panic(expected = "envelope task was dropped before it completed")]
    fn lost_envelope_task_is_not_reported_as_success() {
        let mut stream = from_envelope(Envelope::<u8, ()>::uncancellable(|_| async { Ok(()) }));
        stream.spawn_with(Spawner::new(drop));
        let _ = block_on(stream.next());
    }
}
