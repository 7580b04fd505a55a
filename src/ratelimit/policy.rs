//! Named limiting policies.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::descriptor::{PartitionKey, Partitioner, RequestContext};
use super::queue::{QueueOptions, QueueOrder};
use super::strategy::{
    Concurrency, FixedWindow, LimiterStrategy, SlidingWindow, StrategyKind, TokenBucket,
};
use crate::error::{FloodgateError, Result};
use crate::gate::RejectionHandler;

/// Algorithm parameters for a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LimiterOptions {
    FixedWindow {
        permit_limit: u32,
        window: Duration,
    },
    SlidingWindow {
        permit_limit: u32,
        window: Duration,
        segments_per_window: u32,
    },
    TokenBucket {
        token_limit: u32,
        tokens_per_period: u32,
        replenishment_period: Duration,
    },
    Concurrency {
        permit_limit: u32,
    },
}

impl LimiterOptions {
    pub fn kind(&self) -> StrategyKind {
        match self {
            LimiterOptions::FixedWindow { .. } => StrategyKind::FixedWindow,
            LimiterOptions::SlidingWindow { .. } => StrategyKind::SlidingWindow,
            LimiterOptions::TokenBucket { .. } => StrategyKind::TokenBucket,
            LimiterOptions::Concurrency { .. } => StrategyKind::Concurrency,
        }
    }

    /// Create fresh strategy state for a new partition first seen at `now`.
    pub fn build(&self, now: Duration) -> Box<dyn LimiterStrategy> {
        match *self {
            LimiterOptions::FixedWindow {
                permit_limit,
                window,
            } => Box::new(FixedWindow::new(permit_limit, window, now)),
            LimiterOptions::SlidingWindow {
                permit_limit,
                window,
                segments_per_window,
            } => Box::new(SlidingWindow::new(
                permit_limit,
                window,
                segments_per_window,
                now,
            )),
            LimiterOptions::TokenBucket {
                token_limit,
                tokens_per_period,
                replenishment_period,
            } => Box::new(TokenBucket::new(
                token_limit,
                tokens_per_period,
                replenishment_period,
                now,
            )),
            LimiterOptions::Concurrency { permit_limit } => Box::new(Concurrency::new(permit_limit)),
        }
    }

    /// How often queued waiters can expect capacity to come back, for
    /// time-driven strategies.
    pub fn replenishment_interval(&self) -> Option<Duration> {
        match *self {
            LimiterOptions::FixedWindow { window, .. } => Some(window),
            LimiterOptions::SlidingWindow {
                window,
                segments_per_window,
                ..
            } => Some(window / segments_per_window.max(1)),
            LimiterOptions::TokenBucket {
                replenishment_period,
                ..
            } => Some(replenishment_period),
            LimiterOptions::Concurrency { .. } => None,
        }
    }

    /// Reject parameters that could never admit anything.
    pub fn validate(&self) -> Result<()> {
        match *self {
            LimiterOptions::FixedWindow {
                permit_limit,
                window,
            } => {
                require_positive("permit_limit", permit_limit)?;
                require_duration("window", window)
            }
            LimiterOptions::SlidingWindow {
                permit_limit,
                window,
                segments_per_window,
            } => {
                require_positive("permit_limit", permit_limit)?;
                require_duration("window", window)?;
                require_positive("segments_per_window", segments_per_window)?;
                if (window / segments_per_window).is_zero() {
                    return Err(FloodgateError::Config(format!(
                        "window of {:?} cannot be split into {} segments",
                        window, segments_per_window
                    )));
                }
                Ok(())
            }
            LimiterOptions::TokenBucket {
                token_limit,
                tokens_per_period,
                replenishment_period,
            } => {
                require_positive("token_limit", token_limit)?;
                require_positive("tokens_per_period", tokens_per_period)?;
                require_duration("replenishment_period", replenishment_period)
            }
            LimiterOptions::Concurrency { permit_limit } => {
                require_positive("permit_limit", permit_limit)
            }
        }
    }
}

fn require_positive(field: &str, value: u32) -> Result<()> {
    if value == 0 {
        return Err(FloodgateError::Config(format!("{} must be greater than zero", field)));
    }
    Ok(())
}

fn require_duration(field: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(FloodgateError::Config(format!("{} must be a positive duration", field)));
    }
    Ok(())
}

/// A named limiting policy: algorithm, queue and partitioning.
#[derive(Clone)]
pub struct Policy {
    name: String,
    limiter: LimiterOptions,
    queue: QueueOptions,
    partitioner: Partitioner,
    on_rejected: Option<Arc<dyn RejectionHandler>>,
}

impl Policy {
    /// A policy with no queue that puts every request in one partition.
    pub fn new(name: impl Into<String>, limiter: LimiterOptions) -> Self {
        Self {
            name: name.into(),
            limiter,
            queue: QueueOptions::default(),
            partitioner: Partitioner::default(),
            on_rejected: None,
        }
    }

    pub fn fixed_window(name: impl Into<String>, permit_limit: u32, window: Duration) -> Self {
        Self::new(
            name,
            LimiterOptions::FixedWindow {
                permit_limit,
                window,
            },
        )
    }

    pub fn sliding_window(
        name: impl Into<String>,
        permit_limit: u32,
        window: Duration,
        segments_per_window: u32,
    ) -> Self {
        Self::new(
            name,
            LimiterOptions::SlidingWindow {
                permit_limit,
                window,
                segments_per_window,
            },
        )
    }

    pub fn token_bucket(
        name: impl Into<String>,
        token_limit: u32,
        tokens_per_period: u32,
        replenishment_period: Duration,
    ) -> Self {
        Self::new(
            name,
            LimiterOptions::TokenBucket {
                token_limit,
                tokens_per_period,
                replenishment_period,
            },
        )
    }

    pub fn concurrency(name: impl Into<String>, permit_limit: u32) -> Self {
        Self::new(name, LimiterOptions::Concurrency { permit_limit })
    }

    /// Allow up to `limit` requests per partition to wait for capacity.
    pub fn with_queue(mut self, limit: usize, order: QueueOrder) -> Self {
        self.queue = QueueOptions::new(limit, order);
        self
    }

    pub fn with_partitioner(mut self, partitioner: impl Into<Partitioner>) -> Self {
        self.partitioner = partitioner.into();
        self
    }

    /// Override the gate's rejection handler for this policy.
    pub fn with_rejection_handler(mut self, handler: impl RejectionHandler + 'static) -> Self {
        self.on_rejected = Some(Arc::new(handler));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limiter(&self) -> &LimiterOptions {
        &self.limiter
    }

    pub fn queue(&self) -> QueueOptions {
        self.queue
    }

    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    pub fn rejection_handler(&self) -> Option<&Arc<dyn RejectionHandler>> {
        self.on_rejected.as_ref()
    }

    pub fn partition_key(&self, ctx: &RequestContext) -> PartitionKey {
        self.partitioner.partition_key(ctx)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FloodgateError::Config("policy name must not be empty".to_string()));
        }
        self.limiter
            .validate()
            .map_err(|e| FloodgateError::Config(format!("policy '{}': {}", self.name, e)))
    }

    /// Serializable view of the policy, for diagnostics.
    pub fn summary(&self) -> PolicySummary {
        PolicySummary {
            name: self.name.clone(),
            limiter: self.limiter,
            queue_limit: self.queue.limit,
            queue_order: self.queue.order,
            partition_by: self.partitioner.description().to_string(),
            custom_rejection: self.on_rejected.is_some(),
        }
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("name", &self.name)
            .field("limiter", &self.limiter)
            .field("queue", &self.queue)
            .field("partitioner", &self.partitioner)
            .field("custom_rejection", &self.on_rejected.is_some())
            .finish()
    }
}

/// Flattened description of a policy.
#[derive(Debug, Clone, Serialize)]
pub struct PolicySummary {
    pub name: String,
    pub limiter: LimiterOptions,
    pub queue_limit: usize,
    pub queue_order: QueueOrder,
    pub partition_by: String,
    pub custom_rejection: bool,
}
