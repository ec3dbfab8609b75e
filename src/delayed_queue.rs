//! Delay queue: entries become eligible for delivery only after a
//! per-entry delay, ordered by eligibility time.
//!
//! Used as the verification ("check") queue — a posted article must not be
//! STAT-queried before the server has had time to propagate it. Consumers
//! sleep until the nearest release time; [`DelayedQueue::try_pop`] offers a
//! non-blocking fast path for connections that prefer a quick check over
//! idling.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Queue of delayed entries, safe for concurrent producers and consumers.
///
/// Capacity is advisory: adds always land, but acceptance (the completion
/// of [`push`](Self::push)) is deferred while more than `capacity` entries
/// are queued, backpressuring the posting side when verification lags.
pub struct DelayedQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    /// Wakes sleeping consumers when an earlier entry, finish, or flush
    /// changes what is eligible
    wake: Notify,
    /// Wakes producers waiting for occupancy to drop to capacity
    room: Notify,
}

struct Inner<T> {
    entries: BinaryHeap<Reverse<Entry<T>>>,
    seq: u64,
    finished: bool,
    /// Forced flush: every entry is treated as immediately eligible
    flushed: bool,
}

struct Entry<T> {
    release_at: Instant,
    /// Insertion order, breaking release-time ties FIFO
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.release_at == other.release_at && self.seq == other.seq
    }
}
impl<T> Eq for Entry<T> {}
impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.release_at, self.seq).cmp(&(other.release_at, other.seq))
    }
}

impl<T> DelayedQueue<T> {
    /// Create a queue that backpressures producers beyond `capacity`
    /// queued entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: BinaryHeap::new(),
                seq: 0,
                finished: false,
                flushed: false,
            }),
            wake: Notify::new(),
            room: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn insert(&self, delay: Duration, item: T) {
        let mut inner = self.lock();
        let seq = inner.seq;
        inner.seq += 1;
        inner.entries.push(Reverse(Entry {
            release_at: Instant::now() + delay,
            seq,
            item,
        }));
        drop(inner);
        self.wake.notify_waiters();
    }

    /// Add an entry eligible after `delay`, waiting for acceptance.
    ///
    /// The entry is queued immediately; the future resolves once the queue
    /// holds no more than its capacity, or once it is finished.
    pub async fn push(&self, delay: Duration, item: T) {
        self.insert(delay, item);
        self.accepted().await;
    }

    /// Add an entry without waiting for acceptance.
    ///
    /// Used for reschedules: putting an item back never meaningfully grows
    /// the queue, and stalling the consumer that is rescheduling would
    /// stall the very drain the queue is waiting on.
    pub fn force_push(&self, delay: Duration, item: T) {
        self.insert(delay, item);
    }

    /// Take an already-eligible entry without blocking, or `None`
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.lock();
        let now = Instant::now();
        let eligible = matches!(
            inner.entries.peek(),
            Some(Reverse(head)) if inner.flushed || head.release_at <= now
        );
        if !eligible {
            return None;
        }
        let entry = inner.entries.pop();
        drop(inner);
        self.room.notify_waiters();
        entry.map(|Reverse(e)| e.item)
    }

    /// Take the earliest eligible entry, sleeping until its release time.
    ///
    /// Returns `None` once the queue is finished and drained. Each entry is
    /// delivered to exactly one consumer.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let wake = self.wake.notified();
            tokio::pin!(wake);
            // Register for wakeups before inspecting the heap, so an insert
            // between the check and the await is not lost
            wake.as_mut().enable();
            let deadline = {
                let mut inner = self.lock();
                let now = Instant::now();
                match inner.entries.peek() {
                    Some(Reverse(head)) if inner.flushed || head.release_at <= now => {
                        let entry = inner.entries.pop();
                        drop(inner);
                        self.room.notify_waiters();
                        return entry.map(|Reverse(e)| e.item);
                    }
                    Some(Reverse(head)) => Some(head.release_at),
                    None if inner.finished => return None,
                    None => None,
                }
            };
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = &mut wake => {}
                    }
                }
                None => wake.await,
            }
        }
    }

    /// Cancel outstanding release timers; with `force`, make every entry
    /// immediately eligible so shutdown loses no in-flight delayed work
    pub fn flush_pending(&self, force: bool) {
        if force {
            self.lock().flushed = true;
        }
        self.wake.notify_waiters();
        self.room.notify_waiters();
    }

    /// Mark that no further entries will be added; consumers blocked on an
    /// empty queue resolve with `None`
    pub fn finished(&self) {
        self.lock().finished = true;
        self.wake.notify_waiters();
        self.room.notify_waiters();
    }

    /// Whether no entries remain queued
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Number of queued entries, eligible or not
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the queue currently exceeds its advisory capacity
    pub fn is_full(&self) -> bool {
        self.len() > self.capacity
    }

    async fn accepted(&self) {
        loop {
            let notified = self.room.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.lock();
                if inner.entries.len() <= self.capacity || inner.finished || inner.flushed {
                    return;
                }
            }
            notified.await;
        }
    }
}
