//! In-flight request limit.

use std::time::Duration;

use super::{LimiterStrategy, StrategyKind};

/// Caps the number of leases held at the same time.
///
/// Availability depends on releases, not on time, so no retry hint is given.
#[derive(Debug, Clone)]
pub struct Concurrency {
    permit_limit: u32,
    held: u32,
}

impl Concurrency {
    pub fn new(permit_limit: u32) -> Self {
        Self {
            permit_limit,
            held: 0,
        }
    }

    /// Leases currently held.
    pub fn held(&self) -> u32 {
        self.held
    }
}

impl LimiterStrategy for Concurrency {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Concurrency
    }

    fn try_acquire(&mut self, _now: Duration) -> bool {
        if self.held < self.permit_limit {
            self.held += 1;
            true
        } else {
            false
        }
    }

    fn release(&mut self) {
        self.held = self.held.saturating_sub(1);
    }

    fn requires_release(&self) -> bool {
        true
    }

    fn available_permits(&mut self, _now: Duration) -> u64 {
        u64::from(self.permit_limit.saturating_sub(self.held))
    }

    fn retry_after(&mut self, _now: Duration) -> Option<Duration> {
        if self.held < self.permit_limit {
            Some(Duration::ZERO)
        } else {
            None
        }
    }

    fn is_idle(&mut self, _now: Duration) -> bool {
        self.held == 0
    }
}
