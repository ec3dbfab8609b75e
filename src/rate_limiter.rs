//! Per-server throughput limiting using a token bucket with debt.
//!
//! Unlike a limiter that drains a queue of waiters sequentially, this one
//! computes every caller's release time synchronously at call time: the
//! bucket is replenished, the grant is scheduled for the moment the balance
//! would reach zero, and the weight is debited immediately. The balance may
//! go negative (debt), which is what lets a single call larger than the
//! burst capacity pass through instantly while still delaying later calls.
//!
//! Computing release times independently per call keeps cancellation local:
//! cancelling one pending grant never requires re-deriving anyone else's
//! schedule.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Token-bucket throughput gate for one server.
///
/// `capacity` is the burst size in abstract units (bytes, for uploads) and
/// `period` the time over which `capacity` units are replenished. A zero
/// `period` disables the limiter entirely.
pub struct RateLimiter {
    capacity: f64,
    period: Duration,
    state: Mutex<Bucket>,
    /// Parent token for all pending grants; replaced wholesale by `cancel_all`
    cancel_root: Mutex<CancellationToken>,
}

struct Bucket {
    /// Token balance; negative values are debt already admitted
    balance: f64,
    last_update: Instant,
}

/// One admission through the limiter.
///
/// The release time was fixed when [`RateLimiter::pass`] computed it;
/// dropping the grant without awaiting it does not return tokens.
#[derive(Debug)]
pub struct Grant {
    throttled: bool,
    release_at: Instant,
    token: CancellationToken,
}

impl Grant {
    /// Whether the admission was delayed rather than immediate
    pub fn throttled(&self) -> bool {
        self.throttled
    }

    /// Wait until the grant's release time.
    ///
    /// Returns `true` on release, `false` if the grant was cancelled first
    /// (individually or via [`RateLimiter::cancel_all`]). Immediate grants
    /// always return `true`.
    pub async fn wait(self) -> bool {
        if !self.throttled {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(self.release_at) => true,
            _ = self.token.cancelled() => false,
        }
    }

    /// Cancel this grant's pending release without touching any other
    /// caller's schedule or the bucket balance
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl RateLimiter {
    /// Create a limiter admitting `capacity` units per `period`.
    ///
    /// A zero `period` (or zero `capacity`) disables throttling: every call
    /// to [`pass`](Self::pass) is granted immediately.
    pub fn new(capacity: u64, period: Duration) -> Self {
        Self {
            capacity: capacity as f64,
            period,
            state: Mutex::new(Bucket {
                balance: capacity as f64,
                last_update: Instant::now(),
            }),
            cancel_root: Mutex::new(CancellationToken::new()),
        }
    }

    fn disabled(&self) -> bool {
        self.period.is_zero() || self.capacity <= 0.0
    }

    /// Admit `weight` units, computing the release time now.
    ///
    /// The balance is replenished to at most `capacity`, the release time is
    /// set to the moment the (pre-debit) balance reaches zero, and `weight`
    /// is debited unconditionally — regardless of when the caller actually
    /// awaits the returned [`Grant`].
    pub fn pass(&self, weight: u64) -> Grant {
        let now = Instant::now();
        if self.disabled() {
            return Grant {
                throttled: false,
                release_at: now,
                token: CancellationToken::new(),
            };
        }

        let rate = self.capacity / self.period.as_secs_f64();
        let delay = {
            let mut bucket = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let elapsed = now.saturating_duration_since(bucket.last_update);
            bucket.balance = self
                .capacity
                .min(bucket.balance + elapsed.as_secs_f64() * rate);
            bucket.last_update = now;

            let delay = if bucket.balance >= 0.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(-bucket.balance / rate)
            };
            bucket.balance -= weight as f64;
            delay
        };

        let token = self
            .cancel_root
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .child_token();
        Grant {
            throttled: !delay.is_zero(),
            release_at: now + delay,
            token,
        }
    }

    /// Cancel every not-yet-released grant and reset to a freshly idle
    /// state: full balance, updated timestamp.
    pub fn cancel_all(&self) {
        {
            let mut root = self.cancel_root.lock().unwrap_or_else(|p| p.into_inner());
            root.cancel();
            *root = CancellationToken::new();
        }
        let mut bucket = self.state.lock().unwrap_or_else(|p| p.into_inner());
        bucket.balance = self.capacity;
        bucket.last_update = Instant::now();
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn assert_between(elapsed: Duration, min_ms: u64, max_ms: u64) {
        assert!(
            elapsed >= Duration::from_millis(min_ms) && elapsed <= Duration::from_millis(max_ms),
            "elapsed {elapsed:?} outside [{min_ms}ms, {max_ms}ms]"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn within_burst_is_immediate() {
        let limiter = RateLimiter::new(5, Duration::from_millis(400));
        for _ in 0..4 {
            let grant = limiter.pass(1);
            assert!(!grant.throttled());
            assert!(grant.wait().await);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_call_is_immediate_but_imposes_debt() {
        let limiter = RateLimiter::new(5, Duration::from_millis(100));
        let start = Instant::now();

        // weight 9 > capacity 5, still granted instantly; balance goes to -4
        let g1 = limiter.pass(9);
        assert!(!g1.throttled());

        // -4 of debt at 5 units / 100ms clears in 80ms
        let g2 = limiter.pass(5);
        assert!(g2.throttled());

        // balance is now -9; release 180ms after the calls
        let g3 = limiter.pass(5);
        assert!(g3.throttled());

        assert!(g1.wait().await);
        assert!(g2.wait().await);
        assert_between(start.elapsed(), 80, 85);
        assert!(g3.wait().await);
        assert_between(start.elapsed(), 180, 185);
    }

    #[tokio::test(start_paused = true)]
    async fn release_times_fixed_at_call_time() {
        let limiter = RateLimiter::new(5, Duration::from_millis(100));
        let start = Instant::now();
        let _ = limiter.pass(10);
        let grant = limiter.pass(5);

        // Waiting late does not push the release time back
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(grant.wait().await);
        assert_between(start.elapsed(), 100, 105);
    }

    #[tokio::test(start_paused = true)]
    async fn replenishes_while_idle() {
        let limiter = RateLimiter::new(5, Duration::from_millis(400));
        assert!(!limiter.pass(3).throttled());
        assert!(!limiter.pass(3).throttled()); // balance -1

        // 2 units replenish over 160ms, clearing the debt
        tokio::time::sleep(Duration::from_millis(160)).await;
        assert!(!limiter.pass(1).throttled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_one_leaves_others_untouched() {
        let limiter = RateLimiter::new(5, Duration::from_millis(100));
        let start = Instant::now();
        let _ = limiter.pass(10);
        let g1 = limiter.pass(2);
        let g2 = limiter.pass(2);

        g1.cancel();
        assert!(!g1.wait().await);
        // g2's release time was computed at call time and is unaffected
        assert!(g2.wait().await);
        assert_between(start.elapsed(), 140, 145);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_resets_to_idle() {
        let limiter = RateLimiter::new(5, Duration::from_millis(100));
        let _ = limiter.pass(20);
        let pending = limiter.pass(5);
        assert!(pending.throttled());

        limiter.cancel_all();
        assert!(!pending.wait().await);

        // Freshly idle: the full burst is immediately available again
        assert!(!limiter.pass(5).throttled());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_disables_throttling() {
        let limiter = RateLimiter::new(5, Duration::ZERO);
        for _ in 0..100 {
            let grant = limiter.pass(1_000_000);
            assert!(!grant.throttled());
            assert!(grant.wait().await);
        }
    }
}
