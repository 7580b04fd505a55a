//! Limiting algorithms.
//!
//! Every strategy is a plain state machine over monotonic timestamps. Locking,
//! queuing and lease bookkeeping live in the partition that owns the strategy,
//! so implementations only answer "is a permit available at `now`?".

mod concurrency;
mod fixed_window;
mod sliding_window;
mod token_bucket;

pub use concurrency::Concurrency;
pub use fixed_window::FixedWindow;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The limiting algorithm a policy uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[serde(alias = "FixedWindow")]
    FixedWindow,
    #[serde(alias = "SlidingWindow")]
    SlidingWindow,
    #[serde(alias = "TokenBucket")]
    TokenBucket,
    #[serde(alias = "Concurrency")]
    Concurrency,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::FixedWindow => "fixed_window",
            StrategyKind::SlidingWindow => "sliding_window",
            StrategyKind::TokenBucket => "token_bucket",
            StrategyKind::Concurrency => "concurrency",
        };
        f.write_str(name)
    }
}

/// Per-partition limiter state.
///
/// Methods take `&mut self` because time-driven strategies catch up on elapsed
/// windows, segments or replenishment periods lazily whenever they are asked.
pub trait LimiterStrategy: Send + fmt::Debug {
    /// Which algorithm this is.
    fn kind(&self) -> StrategyKind;

    /// Take one permit at `now` if one is available.
    fn try_acquire(&mut self, now: Duration) -> bool;

    /// Return a permit held by a releasable lease.
    fn release(&mut self) {}

    /// Whether granted permits must be handed back through [`release`](Self::release).
    fn requires_release(&self) -> bool {
        false
    }

    /// Permits that could be granted at `now`.
    fn available_permits(&mut self, now: Duration) -> u64;

    /// Time until a permit becomes available.
    ///
    /// `None` when availability is event driven rather than time driven.
    fn retry_after(&mut self, now: Duration) -> Option<Duration>;

    /// Whether the state at `now` is indistinguishable from a freshly created one.
    fn is_idle(&mut self, now: Duration) -> bool;
}
