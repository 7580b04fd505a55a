//! Fixed window counter.

use std::time::Duration;

use super::{LimiterStrategy, StrategyKind};
use crate::ratelimit::clock::align_down;

/// Counts permits inside windows aligned to the clock origin.
///
/// Windows do not start at the first request. A client can therefore spend a
/// full budget just before a boundary and another just after it.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    /// Maximum permits per window
    permit_limit: u32,
    /// Length of every window
    window: Duration,
    /// When the current window started
    window_start: Duration,
    /// Permits used in the current window
    count: u32,
}

impl FixedWindow {
    /// Create a counter whose first window contains `now`.
    pub fn new(permit_limit: u32, window: Duration, now: Duration) -> Self {
        Self {
            permit_limit,
            window,
            window_start: align_down(now, window),
            count: 0,
        }
    }

    /// Permits used in the current window.
    pub fn current_count(&self) -> u32 {
        self.count
    }

    /// Reset the window if `now` has moved past it.
    fn maybe_reset_window(&mut self, now: Duration) {
        if now >= self.window_start + self.window {
            self.window_start = align_down(now, self.window);
            self.count = 0;
        }
    }
}

impl LimiterStrategy for FixedWindow {
    fn kind(&self) -> StrategyKind {
        StrategyKind::FixedWindow
    }

    fn try_acquire(&mut self, now: Duration) -> bool {
        self.maybe_reset_window(now);

        if self.count < self.permit_limit {
            self.count += 1;
            true
        } else {
            false
        }
    }

    fn available_permits(&mut self, now: Duration) -> u64 {
        self.maybe_reset_window(now);
        u64::from(self.permit_limit.saturating_sub(self.count))
    }

    fn retry_after(&mut self, now: Duration) -> Option<Duration> {
        self.maybe_reset_window(now);

        if self.count < self.permit_limit {
            return Some(Duration::ZERO);
        }
        Some((self.window_start + self.window).saturating_sub(now))
    }

    fn is_idle(&mut self, now: Duration) -> bool {
        self.maybe_reset_window(now);
        self.count == 0
    }
}
