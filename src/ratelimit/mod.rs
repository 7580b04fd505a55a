//! Rate limiting logic and state management.

mod clock;
mod descriptor;
mod eviction;
mod lease;
mod limiter;
mod partition;
mod policy;
mod queue;
mod registry;
mod rules;
pub mod strategy;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use descriptor::{
    PartitionBy, PartitionKey, Partitioner, RequestContext, GLOBAL_PARTITION, UNKNOWN_PARTITION,
};
pub use eviction::{IdleEviction, DEFAULT_IDLE_TIMEOUT, DEFAULT_SWEEP_INTERVAL};
pub use lease::Lease;
pub use limiter::PartitionedLimiter;
pub use partition::{Acquisition, Partition, PartitionStatistics, Waiter};
pub use policy::{LimiterOptions, Policy, PolicySummary};
pub use queue::{QueueOptions, QueueOrder};
pub use registry::{PolicyRegistry, PolicyRegistryBuilder, RegisteredPolicy};
pub use rules::{PolicyConfig, RateLimitConfig, RouteConfig};
pub use strategy::{LimiterStrategy, StrategyKind};
