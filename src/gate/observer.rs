//! Decision hooks for observability.

use std::time::Duration;
use tracing::{debug, info, trace};

use crate::error::LimitError;
use crate::ratelimit::PartitionKey;

/// What the gate decided for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Admitted without waiting.
    Admitted,
    /// Placed in the wait queue.
    Queued,
    /// Left the wait queue with a permit.
    Dequeued { waited: Duration },
    /// Turned away.
    Rejected(LimitError),
    /// Withdrawn by the caller while waiting.
    Cancelled,
}

/// Receives every gate decision.
pub trait DecisionObserver: Send + Sync {
    fn on_decision(&self, policy: &str, key: &PartitionKey, decision: &Decision);
}

impl<T: DecisionObserver + ?Sized> DecisionObserver for std::sync::Arc<T> {
    fn on_decision(&self, policy: &str, key: &PartitionKey, decision: &Decision) {
        (**self).on_decision(policy, key, decision)
    }
}

/// Emits each decision as a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl DecisionObserver for TracingObserver {
    fn on_decision(&self, policy: &str, key: &PartitionKey, decision: &Decision) {
        match decision {
            Decision::Admitted => trace!(policy, key = %key, "Request admitted"),
            Decision::Queued => debug!(policy, key = %key, "Request queued"),
            Decision::Dequeued { waited } => {
                debug!(policy, key = %key, waited_ms = waited.as_millis() as u64, "Queued request admitted")
            }
            Decision::Rejected(reason) => info!(
                policy,
                key = %key,
                reason = %reason,
                retry_after_ms = reason.retry_after().map(|d| d.as_millis() as u64),
                "Request rejected"
            ),
            Decision::Cancelled => debug!(policy, key = %key, "Queued request cancelled"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records decisions for assertions in gate tests.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingObserver {
        pub(crate) decisions: Mutex<Vec<(String, Decision)>>,
    }

    impl RecordingObserver {
        pub(crate) fn kinds(&self) -> Vec<&'static str> {
            self.decisions
                .lock()
                .iter()
                .map(|(_, decision)| match decision {
                    Decision::Admitted => "admitted",
                    Decision::Queued => "queued",
                    Decision::Dequeued { .. } => "dequeued",
                    Decision::Rejected(_) => "rejected",
                    Decision::Cancelled => "cancelled",
                })
                .collect()
        }
    }

    impl DecisionObserver for RecordingObserver {
        fn on_decision(&self, _policy: &str, key: &PartitionKey, decision: &Decision) {
            self.decisions
                .lock()
                .push((key.to_string(), decision.clone()));
        }
    }

    #[test]
    fn test_tracing_observer_accepts_every_decision() {
        let key = PartitionKey::from("client");
        for decision in [
            Decision::Admitted,
            Decision::Queued,
            Decision::Dequeued {
                waited: Duration::from_millis(10),
            },
            Decision::Rejected(LimitError::LimitExceeded { retry_after: None }),
            Decision::Cancelled,
        ] {
            TracingObserver.on_decision("Fixed", &key, &decision);
        }
    }

    #[test]
    fn test_recording_observer() {
        let observer = RecordingObserver::default();
        let key = PartitionKey::from("client");
        observer.on_decision("Fixed", &key, &Decision::Queued);
        observer.on_decision("Fixed", &key, &Decision::Cancelled);
        assert_eq!(observer.kinds(), vec!["queued", "cancelled"]);
    }
}
