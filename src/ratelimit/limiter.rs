//! Partitioned limiter: one independent strategy state per partition key.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::clock::Clock;
use super::descriptor::PartitionKey;
use super::partition::{Acquisition, Partition, PartitionStatistics};
use super::policy::LimiterOptions;
use super::queue::QueueOptions;

/// Maps partition keys to lazily created partitions.
///
/// This struct is thread-safe and can be shared across multiple tasks. Lookups
/// of existing partitions only take a shard read lock; first touch of a key
/// inserts under the shard write lock. Partitions are never evicted here
/// except through [`evict_idle`](Self::evict_idle).
pub struct PartitionedLimiter {
    /// Name of the owning policy, for logging
    policy: Arc<str>,
    options: LimiterOptions,
    queue: QueueOptions,
    clock: Arc<dyn Clock>,
    partitions: DashMap<PartitionKey, Arc<Partition>>,
}

impl PartitionedLimiter {
    pub fn new(
        policy: impl Into<Arc<str>>,
        options: LimiterOptions,
        queue: QueueOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy: policy.into(),
            options,
            queue,
            clock,
            partitions: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }

    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }

    /// Ask the partition for `key` for one permit.
    pub fn acquire(&self, key: &PartitionKey) -> Acquisition {
        loop {
            let partition = self.partition(key);
            if let Some(acquisition) = partition.try_acquire() {
                return acquisition;
            }
            // Retired by a concurrent eviction; the next lookup creates a new one.
            trace!(policy = %self.policy, key = %key, "Partition retired, retrying");
        }
    }

    /// Admit queued waiters across all partitions whose capacity came back.
    ///
    /// Returns the number of waiters admitted.
    pub fn process_queues(&self) -> usize {
        let partitions: Vec<Arc<Partition>> = self
            .partitions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        partitions
            .iter()
            .map(|partition| partition.process_queue())
            .sum()
    }

    /// Admit queued waiters of the partition for `key`.
    pub fn process_queue(&self, key: &PartitionKey) -> usize {
        match self.partitions.get(key).map(|p| Arc::clone(p.value())) {
            Some(partition) => partition.process_queue(),
            None => 0,
        }
    }

    /// Time until a permit frees up for `key`, if the partition exists.
    pub fn retry_after(&self, key: &PartitionKey) -> Option<Duration> {
        let partition = self.partitions.get(key).map(|p| Arc::clone(p.value()))?;
        partition.retry_after()
    }

    /// Record a failed lease that was decided outside the partition, such as
    /// a queue timeout.
    pub(crate) fn record_failure(&self, key: &PartitionKey) {
        if let Some(partition) = self.partitions.get(key).map(|p| Arc::clone(p.value())) {
            partition.record_failure();
        }
    }

    /// Counters for `key`, if the partition exists.
    pub fn statistics(&self, key: &PartitionKey) -> Option<PartitionStatistics> {
        let partition = self.partitions.get(key).map(|p| Arc::clone(p.value()))?;
        Some(partition.statistics())
    }

    /// Number of live partitions.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Remove partitions idle for at least `idle_for` whose state matches a
    /// fresh partition. Returns the number removed.
    pub fn evict_idle(&self, idle_for: Duration) -> usize {
        let mut evicted = 0;
        self.partitions.retain(|_, partition| {
            let retire = partition.retire_if_idle(idle_for);
            if retire {
                evicted += 1;
            }
            !retire
        });

        if evicted > 0 {
            debug!(policy = %self.policy, evicted, "Evicted idle partitions");
        }
        evicted
    }

    /// Drop every partition. Queued waiters are resolved without a lease.
    pub fn clear(&self) {
        let partitions: Vec<Arc<Partition>> = self
            .partitions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.partitions.clear();

        for partition in partitions {
            partition.retire();
        }
    }

    fn partition(&self, key: &PartitionKey) -> Arc<Partition> {
        if let Some(partition) = self.partitions.get(key) {
            return Arc::clone(partition.value());
        }

        let entry = self.partitions.entry(key.clone()).or_insert_with(|| {
            let now = self.clock.now();
            debug!(
                policy = %self.policy,
                key = %key,
                kind = %self.options.kind(),
                "Creating new partition"
            );
            Arc::new(Partition::new(
                key.clone(),
                self.options.build(now),
                self.queue,
                Arc::clone(&self.clock),
            ))
        });
        Arc::clone(entry.value())
    }
}

impl std::fmt::Debug for PartitionedLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedLimiter")
            .field("policy", &self.policy)
            .field("options", &self.options)
            .field("partitions", &self.partitions.len())
            .finish()
    }
}
