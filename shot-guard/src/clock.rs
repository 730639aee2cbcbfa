use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use quanta::Instant;
use quanta::Mock;

/// The time source shared by every admission component.
///
/// Time is reported as the offset from a fixed anchor taken when the clock
/// is created, so all timestamps held in component state are plain
/// `Duration`s and compare cheaply.
#[derive(Clone, Debug)]
pub struct Clock {
    inner: quanta::Clock,
    /// A fixed point in time (TSC tick) to calculate deltas from.
    anchor: Instant,
    /// Wall-clock time at `anchor`, as an offset from the Unix epoch.
    unix_anchor: Duration,
}

impl Clock {
    pub fn new() -> Self {
        Self::with_clock(quanta::Clock::new())
    }

    pub fn with_clock(inner: quanta::Clock) -> Self {
        let anchor = inner.now();
        let unix_anchor = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            inner,
            anchor,
            unix_anchor,
        }
    }

    /// A clock that only moves when the returned handle is incremented.
    pub fn mock() -> (Self, Arc<Mock>) {
        let (inner, mock) = quanta::Clock::mock();
        (Self::with_clock(inner), mock)
    }

    #[inline]
    pub fn now(&self) -> Duration {
        self.inner.now().duration_since(self.anchor)
    }

    /// Converts a clock offset (such as a `reset_at`) to time since the
    /// Unix epoch, for headers like `X-RateLimit-Reset`.
    ///
    /// The wall clock is sampled once, when this clock is created, so the
    /// result stays monotonic even if the system time is adjusted later.
    pub fn unix_time(&self, offset: Duration) -> Duration {
        self.unix_anchor.saturating_add(offset)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
