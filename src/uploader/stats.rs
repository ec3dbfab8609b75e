//! Progress counters and the network-time tracker.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::types::UploadStats;

/// Run-level counters, owned by the engine and updated only from its own
/// worker completion paths
#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) articles_read: AtomicU64,
    pub(crate) articles_re_read: AtomicU64,
    pub(crate) articles_posted: AtomicU64,
    pub(crate) articles_re_posted: AtomicU64,
    pub(crate) bytes_posted: AtomicU64,
    pub(crate) articles_checked: AtomicU64,
    pub(crate) articles_rechecked: AtomicU64,
    pub(crate) check_pending: AtomicU64,
    pub(crate) check_re_pending: AtomicU64,
    pub(crate) post_active: AtomicU64,
    pub(crate) check_active: AtomicU64,
    pub(crate) article_errors: AtomicU64,
}

impl Counters {
    pub(crate) fn snapshot(&self) -> UploadStats {
        UploadStats {
            articles_read: self.articles_read.load(Ordering::SeqCst),
            articles_re_read: self.articles_re_read.load(Ordering::SeqCst),
            articles_posted: self.articles_posted.load(Ordering::SeqCst),
            articles_re_posted: self.articles_re_posted.load(Ordering::SeqCst),
            bytes_posted: self.bytes_posted.load(Ordering::SeqCst),
            articles_checked: self.articles_checked.load(Ordering::SeqCst),
            articles_rechecked: self.articles_rechecked.load(Ordering::SeqCst),
            check_pending: self.check_pending.load(Ordering::SeqCst),
            check_re_pending: self.check_re_pending.load(Ordering::SeqCst),
            post_active: self.post_active.load(Ordering::SeqCst),
            check_active: self.check_active.load(Ordering::SeqCst),
            article_errors: self.article_errors.load(Ordering::SeqCst),
        }
    }
}

/// Tracks wall time during which at least one post request is in flight.
///
/// A reference counter over active requests: the clock runs while any post
/// is outstanding and pauses when none are, giving a usable denominator for
/// raw network upload speed.
#[derive(Default)]
pub(crate) struct UploadTimeTracker {
    state: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    accumulated: Duration,
    started: Option<Instant>,
    active: u32,
}

impl UploadTimeTracker {
    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn start(&self) {
        let mut state = self.lock();
        if state.active == 0 {
            state.started = Some(Instant::now());
        }
        state.active += 1;
    }

    pub(crate) fn end(&self) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            if let Some(started) = state.started.take() {
                state.accumulated += started.elapsed();
            }
        }
    }

    /// Accumulated active time, including any window still open
    pub(crate) fn value(&self) -> Duration {
        let state = self.lock();
        let mut total = state.accumulated;
        if state.active > 0 {
            if let Some(started) = state.started {
                total += started.elapsed();
            }
        }
        total
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn overlapping_requests_count_time_once() {
        let tracker = UploadTimeTracker::default();

        tracker.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracker.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracker.end();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracker.end();

        // 150ms of wall time with >= 1 request active, counted once
        assert_eq!(tracker.value(), Duration::from_millis(150));

        // Clock paused while idle
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tracker.value(), Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn open_window_included_in_value() {
        let tracker = UploadTimeTracker::default();
        tracker.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(tracker.value(), Duration::from_millis(30));
        tracker.end();
    }
}
