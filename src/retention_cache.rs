//! Bounded store for in-flight payloads awaiting verification.
//!
//! Posted articles keep their encoded bytes here so a quick recheck or
//! repost needs no round-trip back to the source. The cache is strictly
//! bounded: when full, inserting either forcibly evicts the oldest entry
//! marked evictable — invoking the eviction hook, which releases bytes but
//! never finalizes the article — or backpressures the inserter until a slot
//! frees up.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Opaque slot identifier returned by an insert
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheHandle(u64);

/// Bounded associative store with insertion-order eviction.
///
/// The eviction hook runs only on forced eviction, never on
/// [`remove`](Self::remove).
pub struct RetentionCache<T> {
    max_entries: usize,
    on_evict: Box<dyn Fn(T) + Send + Sync>,
    inner: Mutex<Inner<T>>,
    /// Wakes inserters waiting for a free slot
    room: Notify,
}

struct Inner<T> {
    /// Insertion-ordered; scanned linearly (bounded by `max_entries`)
    entries: VecDeque<Slot<T>>,
    next_handle: u64,
}

struct Slot<T> {
    handle: u64,
    evictable: bool,
    value: T,
}

impl<T> RetentionCache<T> {
    /// Create a cache holding at most `max_entries`, invoking `on_evict`
    /// with each forcibly evicted value
    pub fn new(max_entries: usize, on_evict: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            max_entries,
            on_evict: Box::new(on_evict),
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                next_handle: 0,
            }),
            room: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Insert without waiting.
    ///
    /// When full, evicts the oldest evictable entry to make room; if no
    /// entry is evictable the value is handed back so the caller can apply
    /// backpressure.
    pub fn try_insert(&self, value: T, evictable: bool) -> Result<CacheHandle, T> {
        let (handle, evicted) = {
            let mut inner = self.lock();
            let mut evicted = None;
            if inner.entries.len() >= self.max_entries {
                let victim = inner.entries.iter().position(|slot| slot.evictable);
                match victim {
                    Some(idx) => evicted = inner.entries.remove(idx),
                    None => return Err(value),
                }
            }
            let handle = inner.next_handle;
            inner.next_handle += 1;
            inner.entries.push_back(Slot {
                handle,
                evictable,
                value,
            });
            (handle, evicted)
        };
        // Hook runs outside the lock; it typically releases article bytes
        if let Some(slot) = evicted {
            (self.on_evict)(slot.value);
        }
        Ok(CacheHandle(handle))
    }

    /// Insert, waiting for a slot when full and nothing is evictable
    pub async fn insert(&self, value: T, evictable: bool) -> CacheHandle {
        let mut value = value;
        loop {
            let notified = self.room.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.try_insert(value, evictable) {
                Ok(handle) => return handle,
                Err(v) => {
                    value = v;
                    notified.await;
                }
            }
        }
    }

    /// Delete an entry without invoking the eviction hook.
    ///
    /// Used when the article completed normally (or is being reposted) and
    /// its bytes must not be released behind its back.
    pub fn remove(&self, handle: CacheHandle) -> Option<T> {
        let removed = {
            let mut inner = self.lock();
            let idx = inner.entries.iter().position(|slot| slot.handle == handle.0);
            idx.and_then(|idx| inner.entries.remove(idx))
        };
        if removed.is_some() {
            self.room.notify_waiters();
        }
        removed.map(|slot| slot.value)
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
