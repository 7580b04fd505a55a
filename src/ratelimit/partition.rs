//! A single partition: one strategy state plus its wait queue.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use super::clock::Clock;
use super::descriptor::PartitionKey;
use super::lease::Lease;
use super::queue::{QueueOptions, WaitQueue};
use super::strategy::{LimiterStrategy, StrategyKind};

/// Result of asking a partition for a permit.
#[derive(Debug)]
pub enum Acquisition {
    /// Admitted immediately.
    Granted(Lease),
    /// No permit available, waiting in the queue.
    Queued(Waiter),
    /// No permit available and the queue is full.
    Rejected(Lease),
}

/// Point-in-time counters for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionStatistics {
    pub kind: StrategyKind,
    pub available_permits: u64,
    pub queued: usize,
    pub total_successful_leases: u64,
    pub total_failed_leases: u64,
}

struct PartitionState {
    strategy: Box<dyn LimiterStrategy>,
    queue: WaitQueue<Lease>,
    last_activity: Duration,
    /// Set when the partition is evicted from its limiter
    retired: bool,
    successful: u64,
    failed: u64,
}

/// Strategy state and wait queue for one partition key.
///
/// All mutation happens under the partition's own lock, so partitions never
/// contend with each other.
pub struct Partition {
    key: PartitionKey,
    clock: Arc<dyn Clock>,
    state: Mutex<PartitionState>,
}

impl Partition {
    pub(crate) fn new(
        key: PartitionKey,
        strategy: Box<dyn LimiterStrategy>,
        queue: QueueOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            key,
            clock,
            state: Mutex::new(PartitionState {
                strategy,
                queue: WaitQueue::new(queue),
                last_activity: now,
                retired: false,
                successful: 0,
                failed: 0,
            }),
        }
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Try to take a permit, queuing the request when there is room.
    ///
    /// Returns `None` if the partition has been retired; the caller should
    /// look the key up again.
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<Acquisition> {
        let mut state = self.state.lock();
        if state.retired {
            return None;
        }

        let now = self.clock.now();
        state.last_activity = now;

        // Waiters get freed capacity before new arrivals.
        self.grant_waiters(&mut state, now);

        if state.strategy.try_acquire(now) {
            state.successful += 1;
            let lease = self.lease(&state);
            return Some(Acquisition::Granted(lease));
        }

        match state.queue.push(now) {
            Some((seq, receiver)) => {
                trace!(key = %self.key, seq, queued = state.queue.len(), "Request queued");
                Some(Acquisition::Queued(Waiter {
                    partition: Arc::clone(self),
                    seq,
                    enqueued_at: now,
                    receiver,
                    finished: false,
                }))
            }
            None => {
                state.failed += 1;
                let retry_after = state.strategy.retry_after(now);
                Some(Acquisition::Rejected(Lease::denied(retry_after)))
            }
        }
    }

    /// Admit queued waiters that fit in the capacity available now.
    pub(crate) fn process_queue(self: &Arc<Self>) -> usize {
        let mut state = self.state.lock();
        if state.queue.is_empty() {
            return 0;
        }
        let now = self.clock.now();
        self.grant_waiters(&mut state, now)
    }

    pub(crate) fn release_permit(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.strategy.release();

        let now = self.clock.now();
        state.last_activity = now;
        self.grant_waiters(&mut state, now);
    }

    /// Withdraw a waiter from the queue.
    fn cancel(&self, seq: u64) -> bool {
        let mut state = self.state.lock();
        let removed = state.queue.remove(seq);
        if removed {
            trace!(key = %self.key, seq, "Queued request withdrawn");
        }
        removed
    }

    /// Time until a permit is expected to become available.
    pub(crate) fn retry_after(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        let now = self.clock.now();
        state.strategy.retry_after(now)
    }

    pub(crate) fn record_failure(&self) {
        self.state.lock().failed += 1;
    }

    pub(crate) fn statistics(&self) -> PartitionStatistics {
        let mut state = self.state.lock();
        let now = self.clock.now();
        PartitionStatistics {
            kind: state.strategy.kind(),
            available_permits: state.strategy.available_permits(now),
            queued: state.queue.len(),
            total_successful_leases: state.successful,
            total_failed_leases: state.failed,
        }
    }

    /// Retire the partition if it has been idle for `idle_for` and its state
    /// is equivalent to a fresh one.
    pub(crate) fn retire_if_idle(&self, idle_for: Duration) -> bool {
        let mut state = self.state.lock();
        if state.retired {
            return true;
        }

        let now = self.clock.now();
        let idle = state.queue.is_empty()
            && now.saturating_sub(state.last_activity) >= idle_for
            && state.strategy.is_idle(now);
        if idle {
            state.retired = true;
        }
        idle
    }

    /// Retire unconditionally, closing every queued waiter.
    pub(crate) fn retire(&self) -> usize {
        let mut state = self.state.lock();
        state.retired = true;
        state.queue.clear()
    }

    fn lease(self: &Arc<Self>, state: &PartitionState) -> Lease {
        let permit = state.strategy.requires_release().then(|| Arc::clone(self));
        Lease::granted(permit)
    }

    fn grant_waiters(self: &Arc<Self>, state: &mut PartitionState, now: Duration) -> usize {
        let mut granted = 0;

        while !state.queue.is_empty() && state.strategy.try_acquire(now) {
            let Some(entry) = state.queue.pop_next() else {
                break;
            };
            let seq = entry.seq();
            let waited = now.saturating_sub(entry.enqueued_at());
            let lease = self.lease(state);

            match entry.grant(lease) {
                Ok(()) => {
                    granted += 1;
                    state.successful += 1;
                    trace!(key = %self.key, seq, waited_ms = waited.as_millis() as u64, "Waiter admitted");
                }
                Err(mut lease) => {
                    // Releasing through the lease would re-enter this lock.
                    lease.disarm();
                    state.strategy.release();
                    warn!(key = %self.key, seq, "Queued request vanished before admission");
                }
            }
        }

        if granted > 0 {
            trace!(key = %self.key, granted, queued = state.queue.len(), "Admitted queued requests");
        }
        granted
    }
}

/// A request waiting in a partition's queue.
///
/// Resolves to the granted lease, or to `None` if the queue was torn down.
/// Dropping an unresolved waiter withdraws it from the queue, freeing its slot.
#[derive(Debug)]
pub struct Waiter {
    partition: Arc<Partition>,
    seq: u64,
    enqueued_at: Duration,
    receiver: oneshot::Receiver<Lease>,
    finished: bool,
}

impl Waiter {
    /// Clock timestamp at which the request joined the queue.
    pub fn enqueued_at(&self) -> Duration {
        self.enqueued_at
    }

    /// Position-independent identifier assigned at enqueue time.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Future for Waiter {
    type Output = Option<Lease>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(result) => {
                self.finished = true;
                Poll::Ready(result.ok())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if !self.partition.cancel(self.seq) {
            // Admitted between the last poll and now; hand the slot back.
            if let Ok(lease) = self.receiver.try_recv() {
                drop(lease);
            }
        }
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition").field("key", &self.key).finish()
    }
}
