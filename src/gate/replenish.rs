//! Background task that hands freed capacity to queued requests.
//!
//! Time-driven strategies (windows, token buckets) regain capacity without any
//! request arriving. Each waiting request re-checks its own partition when
//! its strategy expects capacity back; the replenisher additionally sweeps
//! every time-driven limiter on an interval, so waiters held up by a coarse
//! timer are admitted at most one tick after their permit frees up.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::ratelimit::PolicyRegistry;

/// Default tick between queue sweeps.
pub const DEFAULT_REPLENISH_INTERVAL: Duration = Duration::from_millis(100);

/// Periodically admits queued requests across every policy.
#[derive(Debug, Clone)]
pub struct Replenisher {
    registry: Arc<PolicyRegistry>,
    tick: Duration,
}

impl Replenisher {
    pub fn new(registry: Arc<PolicyRegistry>) -> Self {
        Self {
            registry,
            tick: DEFAULT_REPLENISH_INTERVAL,
        }
    }

    pub fn with_interval(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(1));
        self
    }

    /// Run one sweep. Returns the number of waiters admitted.
    pub fn replenish(&self) -> usize {
        let admitted = self.registry.process_queues();
        if admitted > 0 {
            debug!(admitted, "Admitted queued requests");
        }
        admitted
    }

    /// Spawn the sweep loop on the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(interval_ms = self.tick.as_millis() as u64, "Starting queue replenisher");
        tokio::spawn(async move {
            let mut ticker = interval(self.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.replenish();
            }
        })
    }
}
