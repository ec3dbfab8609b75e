//! Backpressured producer/consumer queue with a reservation protocol.
//!
//! Adds are never refused — occupancy may overshoot the capacity to avoid
//! stalling a producer that already holds an item — but acceptance (the
//! completion of [`BoundedQueue::push`]) is deferred until occupancy drops
//! strictly below capacity again, which is what backpressures upstream
//! article generation.
//!
//! Reservations hold a capacity slot without a concrete item, for work that
//! must asynchronously re-fetch its payload before re-entering the queue.
//! Without them the check pipeline could deadlock waiting on the post queue
//! to free the very slot it was about to fill.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Bounded FIFO channel safe for concurrent producers and consumers.
///
/// Items stay queued until a consumer removes one under the lock, so a
/// [`pop`](Self::pop) future abandoned mid-wait (a losing `select!` arm)
/// never costs an item. Once [`finished`](Self::finished) is called and the
/// queue drains, every blocked or future consumer receives `None`.
pub struct BoundedQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    /// Wakes consumers when an item arrives or the queue is finished
    avail: Notify,
    /// Wakes producers waiting for occupancy to fall below capacity
    room: Notify,
}

struct Inner<T> {
    ready: VecDeque<T>,
    /// Capacity slots held without a concrete item, consumed by `fulfill`
    reserved: usize,
    finished: bool,
}

impl<T> Inner<T> {
    fn occupancy(&self) -> usize {
        self.ready.len() + self.reserved
    }
}

impl<T> BoundedQueue<T> {
    /// Create a queue accepting `capacity` items before backpressuring
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                reserved: 0,
                finished: false,
            }),
            avail: Notify::new(),
            room: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Add an item and wait for it to be accepted.
    ///
    /// The item is enqueued immediately; the future resolves once occupancy
    /// is strictly below capacity, or once the queue is finished.
    pub async fn push(&self, item: T) {
        self.enqueue(item);
        self.accepted().await;
    }

    /// Add an item without waiting for acceptance (forced add)
    pub fn push_nowait(&self, item: T) {
        self.enqueue(item);
    }

    fn enqueue(&self, item: T) {
        self.lock().ready.push_back(item);
        self.avail.notify_waiters();
    }

    /// Hold a capacity slot for an item that will arrive via
    /// [`fulfill`](Self::fulfill)
    pub fn reserve(&self) {
        self.lock().reserved += 1;
    }

    /// Supply the item for a previously reserved slot.
    ///
    /// Enqueues like an add but never re-checks capacity: the slot was
    /// already counted by [`reserve`](Self::reserve).
    pub fn fulfill(&self, item: T) {
        {
            let mut inner = self.lock();
            inner.reserved = inner.reserved.saturating_sub(1);
            inner.ready.push_back(item);
        }
        self.avail.notify_waiters();
    }

    /// Take the next item, in FIFO order.
    ///
    /// Blocks until an item arrives; returns `None` once the queue is
    /// finished and drained. Items are only removed at the moment this
    /// future resolves, so dropping a pending call leaves the queue intact.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.avail.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking, so a concurrent
            // notify_waiters between the check and the await is not lost
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if let Some(item) = inner.ready.pop_front() {
                    drop(inner);
                    self.room.notify_waiters();
                    return Some(item);
                }
                if inner.finished {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark that no further items will be added.
    ///
    /// Consumers blocked with no ready items resolve with the `None`
    /// sentinel immediately.
    pub fn finished(&self) {
        self.lock().finished = true;
        self.avail.notify_waiters();
        self.room.notify_waiters();
    }

    /// Whether [`finished`](Self::finished) has been called
    pub fn has_finished(&self) -> bool {
        self.lock().finished
    }

    /// Number of ready (queued, not reserved) items
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Whether there are no ready items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ready items plus outstanding reservations
    pub fn occupancy(&self) -> usize {
        self.lock().occupancy()
    }

    async fn accepted(&self) {
        loop {
            let notified = self.room.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking, so a concurrent
            // notify_waiters between the check and the await is not lost
            notified.as_mut().enable();
            {
                let inner = self.lock();
                if inner.occupancy() < self.capacity || inner.finished {
                    return;
                }
            }
            notified.await;
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn fifo_order_no_double_delivery() {
        let q = BoundedQueue::new(10);
        for i in 0..5 {
            q.push(i).await;
        }
        for i in 0..5 {
            assert_eq!(q.pop().await, Some(i));
        }
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn blocked_consumers_each_receive_one_item() {
        let q = Arc::new(BoundedQueue::new(4));

        let first = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        q.push(1).await;
        q.push(2).await;

        let mut got = vec![first.await.unwrap(), second.await.unwrap()];
        got.sort();
        assert_eq!(got, [Some(1), Some(2)]);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn abandoned_pop_leaves_items_in_the_queue() {
        let q = BoundedQueue::new(4);
        {
            let pending = q.pop();
            tokio::pin!(pending);
            // Register the consumer, then abandon it before delivery, the
            // way a losing select! arm would
            tokio::select! {
                biased;
                _ = tokio::task::yield_now() => {}
                _ = &mut pending => unreachable!("queue is empty"),
            }
            q.push_nowait(7);
        }
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().await, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn push_backpressures_at_capacity() {
        let q = Arc::new(BoundedQueue::new(2));
        q.push(1).await;

        // Occupancy reaches capacity: acceptance is deferred
        let blocked = {
            let q = q.clone();
            tokio::spawn(async move { q.push(2).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        // The item itself was enqueued without waiting
        assert_eq!(q.len(), 2);

        assert_eq!(q.pop().await, Some(1));
        blocked.await.unwrap();
    }

    #[tokio::test]
    async fn forced_adds_may_exceed_capacity() {
        let q = BoundedQueue::new(1);
        for i in 0..5 {
            q.push_nowait(i);
        }
        assert_eq!(q.len(), 5);
        for i in 0..5 {
            assert_eq!(q.pop().await, Some(i));
        }
    }

    #[tokio::test]
    async fn blocked_consumer_gets_sentinel_exactly_once() {
        let q = Arc::new(BoundedQueue::<u32>::new(4));
        let waiting = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        q.finished();
        assert_eq!(waiting.await.unwrap(), None);
        // Later consumers also observe the drained, finished queue
        assert_eq!(q.pop().await, None);
    }

    #[tokio::test]
    async fn finished_drains_remaining_items_first() {
        let q = BoundedQueue::new(4);
        q.push(7).await;
        q.finished();
        assert_eq!(q.pop().await, Some(7));
        assert_eq!(q.pop().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn reservation_holds_a_slot_until_fulfilled() {
        let q = Arc::new(BoundedQueue::new(1));
        q.reserve();
        assert_eq!(q.occupancy(), 1);

        // The reservation counts against capacity, so this add is not
        // accepted yet
        let blocked = {
            let q = q.clone();
            tokio::spawn(async move { q.push(1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // The blocked push already enqueued its item; the fulfilled one
        // lands behind it
        q.fulfill(0);
        assert_eq!(q.occupancy(), 2);
        assert_eq!(q.pop().await, Some(1));
        assert_eq!(q.pop().await, Some(0));
        blocked.await.unwrap();
    }

    #[tokio::test]
    async fn fulfill_wakes_a_blocked_consumer() {
        let q = Arc::new(BoundedQueue::new(1));
        q.reserve();
        let waiting = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        q.fulfill(9);
        assert_eq!(waiting.await.unwrap(), Some(9));
        assert_eq!(q.occupancy(), 0);
    }
}
