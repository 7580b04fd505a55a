//! Monotonic time sources for the limiter strategies.
//!
//! Strategies never read the wall clock directly. They receive a timestamp
//! expressed as the [`Duration`] elapsed since the clock's origin, which keeps
//! window arithmetic exact and lets tests drive time by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A monotonic time source.
pub trait Clock: Send + Sync + 'static {
    /// Time elapsed since this clock's origin.
    fn now(&self) -> Duration;
}

/// Clock backed by `tokio::time::Instant`.
///
/// Follows tokio's paused time when the runtime is started with
/// `start_paused`, so timer-driven tests stay deterministic.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: tokio::time::Instant,
}

impl MonotonicClock {
    /// Create a clock whose origin is the current instant.
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock positioned at its origin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(as_nanos(by), Ordering::SeqCst);
    }

    /// Jump to an absolute offset from the origin.
    ///
    /// Moving backwards is ignored; the clock stays monotonic.
    pub fn set(&self, at: Duration) {
        self.nanos.fetch_max(as_nanos(at), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

impl<C: Clock> Clock for std::sync::Arc<C> {
    fn now(&self) -> Duration {
        (**self).now()
    }
}

fn as_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Number of whole `period`s contained in `elapsed`.
pub(crate) fn whole_periods(elapsed: Duration, period: Duration) -> u64 {
    let period = as_nanos(period).max(1);
    as_nanos(elapsed) / period
}

/// `period` multiplied by `count`, saturating at `u64::MAX` nanoseconds.
pub(crate) fn periods(period: Duration, count: u64) -> Duration {
    Duration::from_nanos(as_nanos(period).saturating_mul(count))
}

/// Start of the `period`-aligned interval containing `now`.
pub(crate) fn align_down(now: Duration, period: Duration) -> Duration {
    periods(period, whole_periods(now, period))
}
