//! Bounded wait queue for requests that exceed immediate capacity.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;

/// Order in which queued requests are admitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrder {
    /// FIFO: the longest waiting request goes first.
    #[default]
    #[serde(alias = "OldestFirst")]
    OldestFirst,
    /// LIFO: the most recent request goes first.
    #[serde(alias = "NewestFirst")]
    NewestFirst,
}

/// Queue capacity and ordering for a policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Maximum number of waiting requests per partition
    pub limit: usize,
    /// Admission order
    pub order: QueueOrder,
}

impl QueueOptions {
    pub fn new(limit: usize, order: QueueOrder) -> Self {
        Self { limit, order }
    }
}

/// A waiting request.
pub struct QueueEntry<T> {
    /// Assigned at enqueue time, strictly increasing
    seq: u64,
    /// Clock timestamp of arrival
    enqueued_at: Duration,
    sender: oneshot::Sender<T>,
}

impl<T> QueueEntry<T> {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn enqueued_at(&self) -> Duration {
        self.enqueued_at
    }

    /// Resolve the waiter. Hands `value` back if the waiter is gone.
    pub fn grant(self, value: T) -> Result<(), T> {
        self.sender.send(value)
    }
}

impl<T> fmt::Debug for QueueEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("seq", &self.seq)
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}

/// Per-partition wait queue.
///
/// Entries are kept in arrival order. Arrival timestamps never decrease under
/// the partition lock, so ordering by position is ordering by
/// `(enqueued_at, seq)`.
#[derive(Debug)]
pub struct WaitQueue<T> {
    options: QueueOptions,
    entries: VecDeque<QueueEntry<T>>,
    next_seq: u64,
}

impl<T> WaitQueue<T> {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            options,
            entries: VecDeque::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.options.limit
    }

    /// Add a waiter arriving at `now`.
    ///
    /// Returns `None` without queuing anything when the queue is full.
    pub fn push(&mut self, now: Duration) -> Option<(u64, oneshot::Receiver<T>)> {
        if self.is_full() {
            return None;
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let (sender, receiver) = oneshot::channel();
        self.entries.push_back(QueueEntry {
            seq,
            enqueued_at: now,
            sender,
        });
        Some((seq, receiver))
    }

    /// Remove the entry that should be admitted next.
    pub fn pop_next(&mut self) -> Option<QueueEntry<T>> {
        match self.options.order {
            QueueOrder::OldestFirst => self.entries.pop_front(),
            QueueOrder::NewestFirst => self.entries.pop_back(),
        }
    }

    /// Withdraw a waiter. Returns `false` if it was already dequeued.
    pub fn remove(&mut self, seq: u64) -> bool {
        match self.entries.binary_search_by_key(&seq, |entry| entry.seq) {
            Ok(index) => self.entries.remove(index).is_some(),
            Err(_) => false,
        }
    }

    /// Drop every waiter. Their receivers observe a closed channel.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(limit: usize, order: QueueOrder) -> WaitQueue<&'static str> {
        WaitQueue::new(QueueOptions::new(limit, order))
    }

    #[test]
    fn test_oldest_first_admits_in_arrival_order() {
        let mut queue = queue(3, QueueOrder::OldestFirst);
        let (_, mut a) = queue.push(Duration::ZERO).unwrap();
        let (_, mut b) = queue.push(Duration::ZERO).unwrap();
        let (_, mut c) = queue.push(Duration::ZERO).unwrap();

        for name in ["A", "B", "C"] {
            queue.pop_next().unwrap().grant(name).unwrap();
        }

        assert_eq!(a.try_recv().unwrap(), "A");
        assert_eq!(b.try_recv().unwrap(), "B");
        assert_eq!(c.try_recv().unwrap(), "C");
    }

    #[test]
    fn test_newest_first_admits_latest_arrival() {
        let mut queue = queue(2, QueueOrder::NewestFirst);
        let (first, _a) = queue.push(Duration::from_secs(1)).unwrap();
        let (second, _b) = queue.push(Duration::from_secs(2)).unwrap();

        assert_eq!(queue.pop_next().unwrap().seq(), second);
        assert_eq!(queue.pop_next().unwrap().seq(), first);
        assert!(queue.pop_next().is_none());
    }

    #[test]
    fn test_equal_timestamps_keep_sequence_order() {
        let mut queue = queue(2, QueueOrder::OldestFirst);
        let (first, _a) = queue.push(Duration::from_secs(5)).unwrap();
        let (second, _b) = queue.push(Duration::from_secs(5)).unwrap();

        assert!(first < second);
        assert_eq!(queue.pop_next().unwrap().seq(), first);
    }

    #[test]
    fn test_full_queue_refuses_without_queuing() {
        let mut queue = queue(1, QueueOrder::OldestFirst);
        assert!(queue.push(Duration::ZERO).is_some());
        assert!(queue.is_full());
        assert!(queue.push(Duration::ZERO).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_zero_limit_never_queues() {
        let mut queue = queue(0, QueueOrder::OldestFirst);
        assert!(queue.push(Duration::ZERO).is_none());
    }

    #[test]
    fn test_remove_frees_slot_and_keeps_others() {
        let mut queue = queue(2, QueueOrder::OldestFirst);
        let (a, _ra) = queue.push(Duration::ZERO).unwrap();
        let (b, _rb) = queue.push(Duration::ZERO).unwrap();

        assert!(queue.remove(a));
        assert!(!queue.remove(a));
        assert!(queue.push(Duration::ZERO).is_some());
        assert_eq!(queue.pop_next().unwrap().seq(), b);
    }

    #[test]
    fn test_grant_to_dropped_waiter_returns_value() {
        let mut queue = queue(1, QueueOrder::OldestFirst);
        let (_, receiver) = queue.push(Duration::ZERO).unwrap();
        drop(receiver);

        assert_eq!(queue.pop_next().unwrap().grant("lost"), Err("lost"));
    }

    #[test]
    fn test_clear_closes_receivers() {
        let mut queue = queue(2, QueueOrder::OldestFirst);
        let (_, mut receiver) = queue.push(Duration::ZERO).unwrap();

        assert_eq!(queue.clear(), 1);
        assert!(receiver.try_recv().is_err());
    }
}
