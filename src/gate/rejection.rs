//! Rejection handling: what a caller sees when a request is turned away.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

use crate::error::LimitError;
use crate::ratelimit::PartitionKey;

/// HTTP status for rejected requests.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Everything known about a rejected request.
#[derive(Debug, Clone)]
pub struct RejectionContext {
    pub policy: String,
    pub partition_key: PartitionKey,
    /// Wall-clock time at which the request arrived at the gate
    pub attempted_at: DateTime<Utc>,
    /// Time until a permit is expected to free up, when the strategy can tell
    pub retry_after: Option<Duration>,
    pub reason: LimitError,
}

/// Transport-neutral description of the rejection response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectionResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RejectionResponse {
    /// Bare 429 with no headers and no body.
    pub fn too_many_requests() -> Self {
        Self {
            status: TOO_MANY_REQUESTS,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Add a `Retry-After` header in whole seconds, rounded up.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.headers
            .push(("Retry-After".to_string(), retry_after_secs(retry_after).to_string()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// `Retry-After` value for a duration: whole seconds, rounded up.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Produces the response for a rejected request.
///
/// Handlers run once per rejection and may perform side effects such as
/// logging or auditing before answering.
#[async_trait]
pub trait RejectionHandler: Send + Sync {
    async fn on_rejected(&self, ctx: &RejectionContext) -> RejectionResponse;
}

#[async_trait]
impl<F> RejectionHandler for F
where
    F: Fn(&RejectionContext) -> RejectionResponse + Send + Sync,
{
    async fn on_rejected(&self, ctx: &RejectionContext) -> RejectionResponse {
        (self)(ctx)
    }
}

/// Answers 429 with a `Retry-After` header whenever a retry hint exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRejectionHandler;

#[async_trait]
impl RejectionHandler for DefaultRejectionHandler {
    async fn on_rejected(&self, ctx: &RejectionContext) -> RejectionResponse {
        debug!(
            policy = %ctx.policy,
            key = %ctx.partition_key,
            reason = %ctx.reason,
            "Rejecting request"
        );

        let response = RejectionResponse::too_many_requests();
        match ctx.retry_after {
            Some(retry_after) => response.with_retry_after(retry_after),
            None => response,
        }
    }
}
