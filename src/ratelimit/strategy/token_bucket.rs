//! Token bucket with whole-period replenishment.

use std::time::Duration;

use super::{LimiterStrategy, StrategyKind};
use crate::ratelimit::clock::{periods, whole_periods};

/// Bucket that refills `tokens_per_period` tokens every `replenishment_period`.
///
/// Every request costs one token. Partial periods never credit tokens, and the
/// replenishment timestamp only advances by the whole periods consumed.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    token_limit: u32,
    tokens_per_period: u32,
    replenishment_period: Duration,
    tokens: u32,
    last_replenished: Duration,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(
        token_limit: u32,
        tokens_per_period: u32,
        replenishment_period: Duration,
        now: Duration,
    ) -> Self {
        Self {
            token_limit,
            tokens_per_period,
            replenishment_period,
            tokens: token_limit,
            last_replenished: now,
        }
    }

    /// Current token level.
    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    fn replenish(&mut self, now: Duration) {
        let elapsed = now.saturating_sub(self.last_replenished);
        let elapsed_periods = whole_periods(elapsed, self.replenishment_period);
        if elapsed_periods == 0 {
            return;
        }

        let credit = elapsed_periods.saturating_mul(u64::from(self.tokens_per_period));
        let level = u64::from(self.tokens).saturating_add(credit);
        self.tokens = level.min(u64::from(self.token_limit)) as u32;
        self.last_replenished += periods(self.replenishment_period, elapsed_periods);
    }
}

impl LimiterStrategy for TokenBucket {
    fn kind(&self) -> StrategyKind {
        StrategyKind::TokenBucket
    }

    fn try_acquire(&mut self, now: Duration) -> bool {
        self.replenish(now);

        if self.tokens >= 1 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    fn available_permits(&mut self, now: Duration) -> u64 {
        self.replenish(now);
        u64::from(self.tokens)
    }

    fn retry_after(&mut self, now: Duration) -> Option<Duration> {
        self.replenish(now);

        if self.tokens >= 1 {
            return Some(Duration::ZERO);
        }
        let next = self.last_replenished + self.replenishment_period;
        Some(next.saturating_sub(now))
    }

    fn is_idle(&mut self, now: Duration) -> bool {
        self.replenish(now);
        self.tokens == self.token_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_secs(12);

    #[test]
    fn test_full_bucket_then_refill_after_one_period() {
        let mut bucket = TokenBucket::new(4, 4, PERIOD, Duration::ZERO);

        for _ in 0..4 {
            assert!(bucket.try_acquire(Duration::ZERO));
        }
        assert!(!bucket.try_acquire(Duration::ZERO));
        assert_eq!(bucket.retry_after(Duration::ZERO), Some(PERIOD));

        assert!(bucket.try_acquire(PERIOD));
        assert_eq!(bucket.tokens(), 3);
    }

    #[test]
    fn test_partial_period_never_credits() {
        let mut bucket = TokenBucket::new(2, 1, PERIOD, Duration::ZERO);
        bucket.try_acquire(Duration::ZERO);
        bucket.try_acquire(Duration::ZERO);

        assert!(!bucket.try_acquire(Duration::from_millis(11_999)));
        assert!(bucket.try_acquire(Duration::from_secs(12)));
        // The next credit is due at 24s, not 12s + 11.999s.
        assert!(!bucket.try_acquire(Duration::from_millis(23_999)));
        assert!(bucket.try_acquire(Duration::from_secs(24)));
    }

    #[test]
    fn test_level_is_capped_at_token_limit() {
        let mut bucket = TokenBucket::new(3, 2, PERIOD, Duration::ZERO);
        bucket.try_acquire(Duration::ZERO);

        assert_eq!(bucket.available_permits(Duration::from_secs(12 * 10)), 3);
        assert!(bucket.is_idle(Duration::from_secs(12 * 10)));
    }

    #[test]
    fn test_timestamp_advances_by_whole_periods_only() {
        let mut bucket = TokenBucket::new(1, 1, PERIOD, Duration::ZERO);
        bucket.try_acquire(Duration::ZERO);

        // 30s is 2.5 periods: credit lands, remainder is kept for the next one.
        assert!(bucket.try_acquire(Duration::from_secs(30)));
        assert_eq!(bucket.retry_after(Duration::from_secs(30)), Some(Duration::from_secs(6)));
    }
}
