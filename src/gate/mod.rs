//! Request gate: admission, queue waiting, release and rejection.
//!
//! The gate ties the pieces together for one request:
//! - resolve the policy through the [`PolicyRegistry`]
//! - derive the partition key and ask that partition's limiter for a permit
//! - wait in the queue when told to, bounded by the optional queue timeout
//! - hand back an [`Admission`] that releases its lease when dropped, or a
//!   [`Rejection`] carrying the response produced by the rejection handler

mod observer;
mod rejection;
mod replenish;

pub use observer::{Decision, DecisionObserver, TracingObserver};
pub use rejection::{
    retry_after_secs, DefaultRejectionHandler, RejectionContext, RejectionHandler,
    RejectionResponse, TOO_MANY_REQUESTS,
};
pub use replenish::{Replenisher, DEFAULT_REPLENISH_INTERVAL};

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::error::LimitError;
use crate::ratelimit::{
    Acquisition, Lease, PartitionKey, PartitionedLimiter, PolicyRegistry, RegisteredPolicy,
    RequestContext, Waiter,
};

/// Floor on the re-check delay of a queued request.
const MIN_RECHECK: Duration = Duration::from_millis(1);

/// A request that was turned away, with the response to send back.
#[derive(Debug, Clone, Error)]
#[error("request rejected by policy '{policy}' for partition '{partition_key}': {reason}")]
pub struct Rejection {
    pub policy: String,
    pub partition_key: PartitionKey,
    pub reason: LimitError,
    pub response: RejectionResponse,
}

/// Failure modes of [`Gate::acquire_with_cancel`].
#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    /// The cancel signal fired while the request was queued
    #[error("request cancelled while queued")]
    Cancelled,
}

/// Permission to run a request.
///
/// Holds the lease for limited requests; dropping the admission releases it.
#[derive(Debug)]
pub struct Admission {
    policy: Option<String>,
    partition_key: Option<PartitionKey>,
    lease: Option<Lease>,
    waited: Duration,
}

impl Admission {
    fn unlimited() -> Self {
        Self {
            policy: None,
            partition_key: None,
            lease: None,
            waited: Duration::ZERO,
        }
    }

    /// Policy that admitted the request, `None` when no policy applied.
    pub fn policy(&self) -> Option<&str> {
        self.policy.as_deref()
    }

    pub fn partition_key(&self) -> Option<&PartitionKey> {
        self.partition_key.as_ref()
    }

    /// Time spent in the wait queue.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn is_limited(&self) -> bool {
        self.lease.is_some()
    }

    /// Release the lease early. Calling it again does nothing.
    pub fn release(&mut self) {
        if let Some(lease) = self.lease.as_mut() {
            lease.release();
        }
    }
}

enum WaitOutcome {
    Admitted(Lease),
    Closed,
    TimedOut,
    Cancelled,
}

/// Admission controller in front of request handlers.
pub struct Gate {
    registry: Arc<PolicyRegistry>,
    rejection: Arc<dyn RejectionHandler>,
    observer: Arc<dyn DecisionObserver>,
    queue_timeout: Option<Duration>,
}

impl Gate {
    /// Create a gate with the default rejection handler and tracing observer.
    pub fn new(registry: Arc<PolicyRegistry>) -> Self {
        Self {
            registry,
            rejection: Arc::new(DefaultRejectionHandler),
            observer: Arc::new(TracingObserver),
            queue_timeout: None,
        }
    }

    /// Handler used for policies that do not declare their own.
    pub fn with_rejection_handler(mut self, handler: impl RejectionHandler + 'static) -> Self {
        self.rejection = Arc::new(handler);
        self
    }

    pub fn with_observer(mut self, observer: impl DecisionObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Bound the time a request may spend in a wait queue.
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    pub fn queue_timeout(&self) -> Option<Duration> {
        self.queue_timeout
    }

    /// Admit or reject a request, waiting in the queue if necessary.
    pub async fn acquire(&self, ctx: &RequestContext) -> Result<Admission, Rejection> {
        match self.admit(ctx, std::future::pending::<()>()).await {
            Ok(admission) => Ok(admission),
            Err(GateError::Rejected(rejection)) => Err(rejection),
            Err(GateError::Cancelled) => unreachable!("a pending cancel signal never fires"),
        }
    }

    /// Like [`acquire`](Self::acquire), but gives up when `cancel` resolves
    /// while the request is queued. Cancellation frees the queue slot and does
    /// not invoke the rejection handler.
    pub async fn acquire_with_cancel<C>(
        &self,
        ctx: &RequestContext,
        cancel: C,
    ) -> Result<Admission, GateError>
    where
        C: Future<Output = ()>,
    {
        self.admit(ctx, cancel).await
    }

    /// Run `handler` under the gate. The lease is released once the handler
    /// finishes, panics or is dropped.
    pub async fn run<F, Fut, T>(&self, ctx: &RequestContext, handler: F) -> Result<T, Rejection>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let admission = self.acquire(ctx).await?;
        let output = handler().await;
        drop(admission);
        Ok(output)
    }

    async fn admit<C>(&self, ctx: &RequestContext, cancel: C) -> Result<Admission, GateError>
    where
        C: Future<Output = ()>,
    {
        let Some(registered) = self.registry.resolve(ctx) else {
            return Ok(Admission::unlimited());
        };

        let attempted_at = Utc::now();
        let policy = registered.name();
        let key = registered.policy().partition_key(ctx);

        let waiter = match registered.limiter().acquire(&key) {
            Acquisition::Granted(lease) => {
                self.observer.on_decision(policy, &key, &Decision::Admitted);
                return Ok(self.admission(registered, key, lease, Duration::ZERO));
            }
            Acquisition::Rejected(lease) => {
                let reason = LimitError::LimitExceeded {
                    retry_after: lease.retry_after(),
                };
                return Err(self.reject(registered, key, attempted_at, reason).await.into());
            }
            Acquisition::Queued(waiter) => waiter,
        };

        self.observer.on_decision(policy, &key, &Decision::Queued);
        let clock = Arc::clone(self.registry.clock());
        let enqueued_at = waiter.enqueued_at();

        let outcome = tokio::select! {
            biased;
            _ = cancel => WaitOutcome::Cancelled,
            outcome = self.wait(registered.limiter(), &key, waiter) => outcome,
        };
        let waited = clock.now().saturating_sub(enqueued_at);

        match outcome {
            WaitOutcome::Admitted(lease) => {
                self.observer
                    .on_decision(policy, &key, &Decision::Dequeued { waited });
                Ok(self.admission(registered, key, lease, waited))
            }
            WaitOutcome::Cancelled => {
                self.observer.on_decision(policy, &key, &Decision::Cancelled);
                Err(GateError::Cancelled)
            }
            WaitOutcome::TimedOut => {
                let limiter = registered.limiter();
                limiter.record_failure(&key);
                let reason = LimitError::QueueTimeout {
                    waited,
                    retry_after: limiter.retry_after(&key),
                };
                Err(self.reject(registered, key, attempted_at, reason).await.into())
            }
            WaitOutcome::Closed => {
                warn!(policy, key = %key, "Wait queue closed before admission");
                let reason = LimitError::LimitExceeded { retry_after: None };
                Err(self.reject(registered, key, attempted_at, reason).await.into())
            }
        }
    }

    async fn wait(
        &self,
        limiter: &PartitionedLimiter,
        key: &PartitionKey,
        waiter: Waiter,
    ) -> WaitOutcome {
        let waiting = wait_for_lease(limiter, key, waiter);
        let result = match self.queue_timeout {
            Some(limit) => match tokio::time::timeout(limit, waiting).await {
                Ok(result) => result,
                Err(_) => return WaitOutcome::TimedOut,
            },
            None => waiting.await,
        };

        match result {
            Some(lease) => WaitOutcome::Admitted(lease),
            None => WaitOutcome::Closed,
        }
    }

    fn admission(
        &self,
        registered: &RegisteredPolicy,
        key: PartitionKey,
        lease: Lease,
        waited: Duration,
    ) -> Admission {
        Admission {
            policy: Some(registered.name().to_string()),
            partition_key: Some(key),
            lease: Some(lease),
            waited,
        }
    }

    async fn reject(
        &self,
        registered: &RegisteredPolicy,
        key: PartitionKey,
        attempted_at: DateTime<Utc>,
        reason: LimitError,
    ) -> Rejection {
        self.observer
            .on_decision(registered.name(), &key, &Decision::Rejected(reason.clone()));

        let ctx = RejectionContext {
            policy: registered.name().to_string(),
            partition_key: key,
            attempted_at,
            retry_after: reason.retry_after(),
            reason,
        };

        let handler = registered
            .policy()
            .rejection_handler()
            .unwrap_or(&self.rejection);
        let response = handler.on_rejected(&ctx).await;

        Rejection {
            policy: ctx.policy,
            partition_key: ctx.partition_key,
            reason: ctx.reason,
            response,
        }
    }
}

/// Resolve a queued request.
///
/// Time-driven strategies refill without anyone calling back into the
/// partition, so the waiter re-checks its own queue whenever the strategy
/// expects capacity. Release-driven strategies give no hint and are woken by
/// the release itself.
async fn wait_for_lease(
    limiter: &PartitionedLimiter,
    key: &PartitionKey,
    mut waiter: Waiter,
) -> Option<Lease> {
    loop {
        let Some(delay) = limiter.retry_after(key) else {
            return waiter.await;
        };

        tokio::select! {
            biased;
            result = &mut waiter => return result,
            _ = tokio::time::sleep(delay.max(MIN_RECHECK)) => {
                limiter.process_queue(key);
            }
        }
    }
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("registry", &self.registry)
            .field("queue_timeout", &self.queue_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::observer::tests::RecordingObserver;
    use super::*;
    use crate::ratelimit::{Clock, ManualClock, MonotonicClock, Policy, QueueOrder};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;
    use tokio_test::{assert_pending, assert_ready, task};

    const WINDOW: Duration = Duration::from_secs(12);

    fn registry(clock: Arc<dyn Clock>, policy: Policy) -> Arc<PolicyRegistry> {
        let name = policy.name().to_string();
        Arc::new(
            PolicyRegistry::builder(clock)
                .register(policy)
                .unwrap()
                .default_policy(name)
                .build()
                .unwrap(),
        )
    }

    fn manual_gate(policy: Policy) -> (Arc<ManualClock>, Gate) {
        let clock = Arc::new(ManualClock::new());
        let gate = Gate::new(registry(Arc::new(Arc::clone(&clock)), policy));
        (clock, gate)
    }

    fn statistics(gate: &Gate, policy: &str) -> crate::ratelimit::PartitionStatistics {
        gate.registry()
            .get(policy)
            .unwrap()
            .limiter()
            .statistics(&PartitionKey::from(crate::ratelimit::GLOBAL_PARTITION))
            .unwrap()
    }

    #[tokio::test]
    async fn test_fixed_window_admits_queues_and_rejects() {
        let observer = Arc::new(RecordingObserver::default());
        let clock = Arc::new(ManualClock::new());
        let policy = Policy::fixed_window("Fixed", 4, WINDOW).with_queue(2, QueueOrder::OldestFirst);
        let gate = Gate::new(registry(Arc::new(Arc::clone(&clock)), policy))
            .with_observer(Arc::clone(&observer));
        let ctx = RequestContext::new().with_route("/api/product");

        let mut admitted = Vec::new();
        for _ in 0..4 {
            admitted.push(gate.acquire(&ctx).await.unwrap());
        }

        let mut fifth = task::spawn(gate.acquire(&ctx));
        let mut sixth = task::spawn(gate.acquire(&ctx));
        assert_pending!(fifth.poll());
        assert_pending!(sixth.poll());

        let rejection = gate.acquire(&ctx).await.unwrap_err();
        assert_eq!(rejection.policy, "Fixed");
        assert_eq!(rejection.response.status, TOO_MANY_REQUESTS);
        assert_eq!(rejection.response.header("Retry-After"), Some("12"));

        clock.advance(WINDOW);
        assert_eq!(gate.registry().process_queues(), 2);

        let fifth = assert_ready!(fifth.poll()).unwrap();
        let sixth = assert_ready!(sixth.poll()).unwrap();
        assert_eq!(fifth.waited(), WINDOW);
        assert_eq!(sixth.policy(), Some("Fixed"));

        assert_eq!(
            observer.kinds(),
            vec![
                "admitted", "admitted", "admitted", "admitted", "queued", "queued", "rejected",
                "dequeued", "dequeued",
            ]
        );

        let stats = statistics(&gate, "Fixed");
        assert_eq!(stats.total_successful_leases, 6);
        assert_eq!(stats.total_failed_leases, 1);
    }

    #[tokio::test]
    async fn test_queue_serves_in_arrival_order() {
        let (_, gate) = manual_gate(
            Policy::concurrency("Concurrency", 1).with_queue(2, QueueOrder::OldestFirst),
        );
        let ctx = RequestContext::new();

        let a = gate.acquire(&ctx).await.unwrap();
        let mut b = task::spawn(gate.acquire(&ctx));
        let mut c = task::spawn(gate.acquire(&ctx));
        assert_pending!(b.poll());
        assert_pending!(c.poll());

        // Queue full: the next request is rejected without suspending.
        let mut d = task::spawn(gate.acquire(&ctx));
        let rejection = assert_ready!(d.poll()).unwrap_err();
        assert_eq!(rejection.response.header("Retry-After"), None);

        drop(a);
        let b = assert_ready!(b.poll()).unwrap();
        assert_pending!(c.poll());

        drop(b);
        assert!(assert_ready!(c.poll()).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_frees_slot_without_rejection() {
        let rejections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&rejections);
        let (_, gate) = manual_gate(
            Policy::concurrency("Concurrency", 1).with_queue(1, QueueOrder::OldestFirst),
        );
        let gate = gate.with_rejection_handler(move |_: &RejectionContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            RejectionResponse::too_many_requests()
        });
        let ctx = RequestContext::new();

        let held = gate.acquire(&ctx).await.unwrap();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let mut waiting = task::spawn(gate.acquire_with_cancel(&ctx, async move {
            let _ = cancel_rx.await;
        }));
        assert_pending!(waiting.poll());
        assert_eq!(statistics(&gate, "Concurrency").queued, 1);

        cancel_tx.send(()).unwrap();
        assert!(matches!(assert_ready!(waiting.poll()), Err(GateError::Cancelled)));
        assert_eq!(statistics(&gate, "Concurrency").queued, 0);
        assert_eq!(rejections.load(Ordering::SeqCst), 0);

        drop(held);
        assert!(gate.acquire(&ctx).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_rejects() {
        let policy = Policy::concurrency("Concurrency", 1).with_queue(1, QueueOrder::OldestFirst);
        let gate = Gate::new(registry(Arc::new(MonotonicClock::new()), policy))
            .with_queue_timeout(Duration::from_secs(1));
        let ctx = RequestContext::new();

        let _held = gate.acquire(&ctx).await.unwrap();
        let rejection = gate.acquire(&ctx).await.unwrap_err();

        match rejection.reason {
            LimitError::QueueTimeout { waited, retry_after } => {
                assert!(waited >= Duration::from_secs(1));
                assert_eq!(retry_after, None);
            }
            other => panic!("expected a queue timeout, got {:?}", other),
        }

        let stats = statistics(&gate, "Concurrency");
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.total_failed_leases, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reset_admits_waiter_without_replenisher() {
        let policy = Policy::fixed_window("Fixed", 1, WINDOW).with_queue(1, QueueOrder::OldestFirst);
        let gate = Gate::new(registry(Arc::new(MonotonicClock::new()), policy))
            .with_queue_timeout(Duration::from_secs(60));
        let ctx = RequestContext::new();

        let _first = gate.acquire(&ctx).await.unwrap();
        let second = gate.acquire(&ctx).await.unwrap();

        assert!(second.waited() >= WINDOW);
        assert!(second.waited() < WINDOW + Duration::from_secs(1));
        assert_eq!(statistics(&gate, "Fixed").total_failed_leases, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_refill_admits_waiter_without_replenisher() {
        let policy = Policy::token_bucket("Token", 4, 4, WINDOW)
            .with_queue(2, QueueOrder::OldestFirst);
        let gate = Gate::new(registry(Arc::new(MonotonicClock::new()), policy));
        let ctx = RequestContext::new();

        for _ in 0..4 {
            gate.acquire(&ctx).await.unwrap();
        }
        let fifth = gate.acquire(&ctx).await.unwrap();

        assert!(fifth.waited() >= WINDOW);
        assert_eq!(statistics(&gate, "Token").available_permits, 3);
    }

    #[tokio::test]
    async fn test_run_releases_after_handler() {
        let (_, gate) = manual_gate(Policy::concurrency("Concurrency", 1));
        let ctx = RequestContext::new();

        let value = gate.run(&ctx, || async { 42 }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(statistics(&gate, "Concurrency").available_permits, 1);

        let held = gate.acquire(&ctx).await.unwrap();
        assert!(gate.run(&ctx, || async {}).await.is_err());
        drop(held);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_holders_never_exceed_limit() {
        let (_, gate) = manual_gate(
            Policy::concurrency("Concurrency", 3).with_queue(32, QueueOrder::OldestFirst),
        );
        let gate = Arc::new(gate);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..24 {
            let gate = Arc::clone(&gate);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                gate.run(&RequestContext::new(), || async {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(statistics(&gate, "Concurrency").available_permits, 3);
    }

    #[tokio::test]
    async fn test_admission_release_is_idempotent() {
        let (_, gate) = manual_gate(Policy::concurrency("Concurrency", 2));
        let ctx = RequestContext::new();

        let mut first = gate.acquire(&ctx).await.unwrap();
        let _second = gate.acquire(&ctx).await.unwrap();
        first.release();
        first.release();
        drop(first);

        assert_eq!(statistics(&gate, "Concurrency").available_permits, 1);
    }

    #[tokio::test]
    async fn test_unmatched_request_is_unlimited() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let registry = PolicyRegistry::builder(clock)
            .register(Policy::fixed_window("Fixed", 1, WINDOW))
            .unwrap()
            .build()
            .unwrap();
        let gate = Gate::new(Arc::new(registry));

        for _ in 0..10 {
            let admission = gate.acquire(&RequestContext::new()).await.unwrap();
            assert!(!admission.is_limited());
            assert_eq!(admission.policy(), None);
        }
    }

    #[tokio::test]
    async fn test_policy_handler_overrides_gate_handler() {
        let policy = Policy::fixed_window("Fixed", 1, WINDOW).with_rejection_handler(
            |ctx: &RejectionContext| RejectionResponse {
                status: 503,
                headers: Vec::new(),
                body: Some(format!("{} is busy", ctx.policy)),
            },
        );
        let (_, gate) = manual_gate(policy);
        let ctx = RequestContext::new();

        let _admitted = gate.acquire(&ctx).await.unwrap();
        let rejection = gate.acquire(&ctx).await.unwrap_err();
        assert_eq!(rejection.response.status, 503);
        assert_eq!(rejection.response.body.as_deref(), Some("Fixed is busy"));
    }
}
