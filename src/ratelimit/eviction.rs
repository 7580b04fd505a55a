//! Idle partition eviction.
//!
//! Partitions are created on first touch and would otherwise live forever. The
//! sweeper removes partitions that have been quiet for a while and whose state
//! is indistinguishable from a fresh partition, so eviction never changes an
//! admission decision.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::registry::PolicyRegistry;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic sweeper over every limiter in a registry.
#[derive(Debug, Clone)]
pub struct IdleEviction {
    registry: Arc<PolicyRegistry>,
    idle_for: Duration,
    sweep_every: Duration,
}

impl IdleEviction {
    pub fn new(registry: Arc<PolicyRegistry>) -> Self {
        Self {
            registry,
            idle_for: DEFAULT_IDLE_TIMEOUT,
            sweep_every: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Minimum quiet time before a partition may be evicted.
    pub fn with_idle_timeout(mut self, idle_for: Duration) -> Self {
        self.idle_for = idle_for;
        self
    }

    pub fn with_sweep_interval(mut self, every: Duration) -> Self {
        self.sweep_every = every.max(Duration::from_millis(1));
        self
    }

    /// Evict idle partitions across all policies. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let evicted: usize = self
            .registry
            .policies()
            .iter()
            .map(|registered| registered.limiter().evict_idle(self.idle_for))
            .sum();

        if evicted > 0 {
            debug!(evicted, "Idle partition sweep finished");
        }
        evicted
    }

    /// Spawn the sweep loop on the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            idle_secs = self.idle_for.as_secs(),
            sweep_secs = self.sweep_every.as_secs(),
            "Starting idle partition eviction"
        );
        tokio::spawn(async move {
            let mut ticker = interval(self.sweep_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing can be idle yet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }
}
