use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::error::Rejection;
use crate::key::RateLimitKey;
use crate::store::CounterStore;
use crate::store::InMemoryCounterStore;
use crate::store::WindowLimit;

/// The outcome of one rate limit check, with the metadata a boundary layer
/// needs for `X-RateLimit-*` headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: usize,
    pub remaining: usize,
    /// Clock offset at which the deciding window frees a slot.
    ///
    /// This is relative to the limiter's [`Clock`], not the Unix epoch. Use
    /// [`retry_after`](Self::retry_after) for `Retry-After`, or
    /// [`Clock::unix_time`] for an absolute `X-RateLimit-Reset`.
    pub reset_at: Duration,
    /// Clock offset the check was made at.
    pub now: Duration,
}

impl RateLimitDecision {
    /// Time from the check until a retry can succeed.
    pub fn retry_after(&self) -> Duration {
        self.reset_at.saturating_sub(self.now)
    }

    /// Converts a rejected decision into the matching [`Rejection`].
    pub fn into_result(self) -> Result<Self, Rejection> {
        if self.allowed {
            Ok(self)
        } else {
            Err(Rejection::RateLimited {
                retry_after: self.retry_after(),
                limit: self.limit,
                reset_at: self.reset_at,
            })
        }
    }
}

/// A sliding-window log rate limiter.
///
/// Unlike a window counter this keeps every admitted timestamp, so a key
/// never gets more than `limit` requests in any trailing window, even
/// across window boundaries. Per-key work is serialized by the store.
#[derive(Debug)]
pub struct SlidingWindowRateLimiter<S: CounterStore + ?Sized = InMemoryCounterStore> {
    store: Arc<S>,
    windows: Vec<WindowLimit>,
    clock: Clock,
}

impl SlidingWindowRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryCounterStore::new()), Clock::new())
    }
}

impl<S: CounterStore + ?Sized> SlidingWindowRateLimiter<S> {
    pub fn with_store(config: &RateLimitConfig, store: Arc<S>, clock: Clock) -> Self {
        Self {
            store,
            windows: config.windows(),
            clock,
        }
    }

    /// Checks `key` against a single ad hoc window.
    pub fn check(&self, key: &RateLimitKey, limit: usize, window: Duration) -> RateLimitDecision {
        self.check_windows(key, &[WindowLimit::new(limit, window)])
    }

    /// Checks `key` against the configured windows (burst, steady, long).
    pub fn check_key(&self, key: &RateLimitKey) -> RateLimitDecision {
        self.check_windows(key, &self.windows)
    }

    fn check_windows(&self, key: &RateLimitKey, windows: &[WindowLimit]) -> RateLimitDecision {
        let now = self.clock.now();
        let outcome = self.store.hit(key, windows, now);
        tracing::trace!(
            key = %key,
            allowed = outcome.allowed,
            remaining = outcome.remaining,
            "rate limit check"
        );
        RateLimitDecision {
            allowed: outcome.allowed,
            limit: outcome.limit,
            remaining: outcome.remaining,
            reset_at: outcome.reset_at,
            now,
        }
    }

    pub fn windows(&self) -> &[WindowLimit] {
        &self.windows
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The clock `reset_at` offsets are measured on.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Evicts idle keys from the store.
    pub fn sweep(&self) -> usize {
        self.store.sweep(self.clock.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn limiter(config: &RateLimitConfig) -> (SlidingWindowRateLimiter, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        let limiter =
            SlidingWindowRateLimiter::with_store(config, Arc::new(InMemoryCounterStore::new()), clock);
        (limiter, mock)
    }

    #[test]
    fn it_admits_three_then_waits_for_the_oldest_to_age_out() {
        let (limiter, mock) = limiter(&RateLimitConfig::default());
        let key = RateLimitKey::new("client").unwrap();

        // 1. Three requests at t=0, 1, 2 are admitted
        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check(&key, 3, secs(10));
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            mock.increment(secs(1));
        }

        // 2. The fourth at t=3 is rejected until the t=0 entry expires
        let decision = limiter.check(&key, 3, secs(10));
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_at, secs(10));
        assert_eq!(decision.retry_after(), secs(7));

        // 3. At t=11 the oldest entry has aged out
        mock.increment(secs(8));
        assert!(limiter.check(&key, 3, secs(10)).allowed);
    }

    #[test]
    fn it_admits_at_exactly_reset_at() {
        let (limiter, mock) = limiter(&RateLimitConfig::default());
        let key = RateLimitKey::new("edge").unwrap();

        assert!(limiter.check(&key, 1, secs(10)).allowed);
        mock.increment(Duration::from_millis(9_999));
        assert!(!limiter.check(&key, 1, secs(10)).allowed);
        mock.increment(Duration::from_millis(1));
        assert!(limiter.check(&key, 1, secs(10)).allowed);
    }

    #[test]
    fn it_never_exceeds_the_limit_in_any_window() {
        let (limiter, mock) = limiter(&RateLimitConfig::default());
        let key = RateLimitKey::new("steady").unwrap();
        let mut admitted_at = Vec::new();

        for tick in 0..300u64 {
            if limiter.check(&key, 5, secs(10)).allowed {
                admitted_at.push(tick * 250);
            }
            mock.increment(Duration::from_millis(250));
        }

        for (i, start) in admitted_at.iter().enumerate() {
            let in_window = admitted_at[i..]
                .iter()
                .take_while(|&&t| t < start + 10_000)
                .count();
            assert!(in_window <= 5, "{in_window} admitted within 10s of {start}ms");
        }
        // Sustained load should still get the full rate over 75s.
        assert!(admitted_at.len() >= 35);
    }

    #[test]
    fn keys_are_isolated() {
        let (limiter, _mock) = limiter(&RateLimitConfig::default());
        let a = RateLimitKey::new("a").unwrap();
        let b = RateLimitKey::new("b").unwrap();

        assert!(limiter.check(&a, 1, secs(10)).allowed);
        assert!(!limiter.check(&a, 1, secs(10)).allowed);
        assert!(limiter.check(&b, 1, secs(10)).allowed);
    }

    #[test]
    fn burst_window_is_checked_before_the_steady_window() {
        let config = RateLimitConfig::new(10, secs(60)).with_burst(2);
        let (limiter, mock) = limiter(&config);
        let key = RateLimitKey::new("bursty").unwrap();

        assert!(limiter.check_key(&key).allowed);
        let second = limiter.check_key(&key);
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        let third = limiter.check_key(&key);
        assert!(!third.allowed);
        assert_eq!(third.limit, 2);
        assert_eq!(third.retry_after(), secs(1));

        mock.increment(secs(1));
        let fourth = limiter.check_key(&key);
        assert!(fourth.allowed);
        assert_eq!(fourth.remaining, 1, "burst window is the tightest again");
    }

    #[test]
    fn rejected_decisions_become_rate_limited() {
        let (limiter, _mock) = limiter(&RateLimitConfig::default());
        let key = RateLimitKey::new("x").unwrap();

        assert!(limiter.check(&key, 1, secs(30)).into_result().is_ok());
        assert_eq!(
            limiter.check(&key, 1, secs(30)).into_result(),
            Err(Rejection::RateLimited {
                retry_after: secs(30),
                limit: 1,
                reset_at: secs(30),
            })
        );
    }

    #[test]
    fn sub_second_windows_are_enforced() {
        let config = RateLimitConfig::new(1, Duration::from_millis(500));
        let (limiter, mock) = limiter(&config);
        let key = RateLimitKey::new("fast").unwrap();

        assert_eq!(
            limiter.windows(),
            &[WindowLimit::new(1, Duration::from_millis(500))]
        );
        assert!(limiter.check_key(&key).allowed);

        let rejected = limiter.check_key(&key);
        assert!(!rejected.allowed);
        assert_eq!(rejected.retry_after(), Duration::from_millis(500));

        mock.increment(Duration::from_millis(499));
        assert!(!limiter.check_key(&key).allowed);
        mock.increment(Duration::from_millis(1));
        assert!(limiter.check_key(&key).allowed);
    }

    #[test]
    fn reset_at_converts_to_wall_clock_time() {
        let (limiter, mock) = limiter(&RateLimitConfig::new(1, secs(30)));
        let key = RateLimitKey::new("reset").unwrap();
        let start = limiter.clock().unix_time(Duration::ZERO);

        mock.increment(secs(5));
        limiter.check_key(&key);
        let rejected = limiter.check_key(&key);

        assert_eq!(
            limiter.clock().unix_time(rejected.reset_at) - start,
            secs(35)
        );
    }

    #[test]
    fn concurrent_checks_admit_exactly_the_limit() {
        use std::thread;

        let (limiter, _mock) = limiter(&RateLimitConfig::new(100, secs(60)));
        let limiter = Arc::new(limiter);
        let key = RateLimitKey::new("shared").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let key = key.clone();
                thread::spawn(move || (0..50).filter(|_| limiter.check_key(&key).allowed).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(admitted, 100);
    }
}
