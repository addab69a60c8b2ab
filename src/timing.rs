//! Executor agnostic timer.
//!
//! [`Sleep`] works on any executor. Deadlines are kept in a heap owned by a
//! single dedicated timer thread, which wakes each `Sleep` once its deadline
//! passes. The timer thread never runs user work, so pending timers cannot
//! hold up anything scheduled on the shared background pool.

use std::{
    cmp::{Ordering as CmpOrdering, Reverse},
    collections::BinaryHeap,
    pin::Pin,
    sync::{
        Arc, Condvar, Mutex, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures::task::AtomicWaker;

static TIMER: OnceLock<Arc<Timer>> = OnceLock::new();

struct Alarm {
    rung: AtomicBool,
    waker: AtomicWaker,
}

struct Entry {
    deadline: Instant,
    key: u64,
    alarm: Arc<Alarm>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.key).cmp(&(other.deadline, other.key))
    }
}

// Pending deadlines, earliest first.
struct Timer {
    entries: Mutex<BinaryHeap<Reverse<Entry>>>,
    changed: Condvar,
    next_key: AtomicU64,
}

impl Timer {
    fn get() -> &'static Arc<Timer> {
        TIMER.get_or_init(|| {
            let timer = Arc::new(Timer {
                entries: Mutex::new(BinaryHeap::new()),
                changed: Condvar::new(),
                next_key: AtomicU64::new(0),
            });
            let remote = Arc::clone(&timer);
            std::thread::Builder::new()
                .name("reflow-timer".to_owned())
                .spawn(move || remote.run())
                .expect("Timer thread creation failed");
            timer
        })
    }

    fn insert(&self, deadline: Instant, alarm: Arc<Alarm>) -> u64 {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().unwrap();
        let earliest = entries.peek().is_none_or(|Reverse(first)| deadline < first.deadline);
        entries.push(Reverse(Entry { deadline, key, alarm }));
        if earliest {
            self.changed.notify_one();
        }
        key
    }

    fn remove(&self, key: u64) {
        self.entries.lock().unwrap().retain(|Reverse(entry)| entry.key != key);
    }

    fn run(&self) {
        let mut entries = self.entries.lock().unwrap();
        loop {
            let now = Instant::now();
            let mut due = Vec::new();
            while entries.peek().is_some_and(|Reverse(first)| first.deadline <= now) {
                if let Some(Reverse(entry)) = entries.pop() {
                    due.push(entry.alarm);
                }
            }
            if !due.is_empty() {
                // Wakers may drop other sleeps, which takes the lock.
                drop(entries);
                for alarm in due {
                    alarm.rung.store(true, Ordering::Release);
                    alarm.waker.wake();
                }
                entries = self.entries.lock().unwrap();
                continue;
            }
            let next = entries.peek().map(|Reverse(first)| first.deadline);
            entries = match next {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(now);
                    self.changed.wait_timeout(entries, timeout).unwrap().0
                }
                None => self.changed.wait(entries).unwrap(),
            };
        }
    }
}

/// A future that resolves once a deadline has passed.
///
/// The countdown starts when the `Sleep` is created, ***not*** when it is first
/// awaited. Dropping an armed `Sleep` withdraws its deadline from the timer.
#[must_use = "futures do nothing unless polled or .awaited"]
pub struct Sleep {
    deadline: Instant,
    armed: Option<(u64, Arc<Alarm>)>,
}

impl Sleep {
    /// Creates a `Sleep` that resolves `duration` from now.
    pub fn new(duration: Duration) -> Self {
        Self::until(Instant::now() + duration)
    }

    /// Creates a `Sleep` that resolves at `deadline`.
    pub fn until(deadline: Instant) -> Self {
        Sleep {
            deadline,
            armed: None,
        }
    }

    /// The instant at which this `Sleep` resolves.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    fn arm(&mut self, cx: &mut Context<'_>) -> bool {
        if let Some((_, alarm)) = &self.armed {
            alarm.waker.register(cx.waker());
            return alarm.rung.load(Ordering::Acquire);
        }
        let alarm = Arc::new(Alarm {
            rung: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        });
        alarm.waker.register(cx.waker());
        let key = Timer::get().insert(self.deadline, Arc::clone(&alarm));
        self.armed = Some((key, alarm));
        false
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if Instant::now() >= self.deadline || self.arm(cx) {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some((key, alarm)) = self.armed.take() {
            if !alarm.rung.load(Ordering::Acquire) {
                Timer::get().remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{FutureExt, executor::block_on, task::noop_waker_ref};

    #[test]
    fn elapsed_deadline_is_ready_immediately() {
        let sleep = Sleep::until(Instant::now() - Duration::from_millis(1));
        assert!(sleep.now_or_never().is_some());
    }

    #[test]
    fn waits_at_least_the_duration() {
        let start = Instant::now();
        block_on(Sleep::new(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn earlier_deadline_is_not_held_up_by_later_one() {
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut late = Sleep::new(Duration::from_secs(30));
        assert!(late.poll_unpin(&mut cx).is_pending());

        let start = Instant::now();
        block_on(Sleep::new(Duration::from_millis(20)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn dropping_armed_sleep_withdraws_its_deadline() {
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut sleeps: Vec<_> = (0..32).map(|_| Sleep::new(Duration::from_secs(3600))).collect();
        for sleep in &mut sleeps {
            assert!(sleep.poll_unpin(&mut cx).is_pending());
        }
        let keys: Vec<u64> = sleeps
            .iter()
            .filter_map(|sleep| sleep.armed.as_ref().map(|(key, _)| *key))
            .collect();
        assert_eq!(keys.len(), 32);
        drop(sleeps);

        let entries = Timer::get().entries.lock().unwrap();
        assert!(entries.iter().all(|Reverse(entry)| !keys.contains(&entry.key)));
    }
}
