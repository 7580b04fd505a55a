//! Rate limit policy configuration.
//!
//! This module handles loading policy definitions from configuration and
//! turning them into a [`PolicyRegistry`]. Durations are given in
//! milliseconds; partitioning is chosen by name (see [`PartitionBy`]).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::clock::Clock;
use super::descriptor::PartitionBy;
use super::policy::{LimiterOptions, Policy};
use super::queue::QueueOrder;
use super::registry::PolicyRegistry;
use super::strategy::StrategyKind;
use crate::error::{FloodgateError, Result};

/// The complete set of policies and how requests map onto them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Policy applied when nothing more specific matches
    #[serde(default)]
    pub default_policy: Option<String>,

    #[serde(default)]
    pub policies: Vec<PolicyConfig>,

    /// Per-route policy overrides
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Binds a request route to a named policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub path: String,
    pub policy: String,
}

/// Configuration for one named policy.
///
/// Which numeric fields are required depends on `kind`:
/// - `fixed_window`: `permit_limit`, `window_ms`
/// - `sliding_window`: `permit_limit`, `window_ms`, `segments_per_window`
/// - `token_bucket`: `token_limit` (or `permit_limit`), `tokens_per_period`,
///   `replenishment_period_ms`
/// - `concurrency`: `permit_limit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    pub kind: StrategyKind,

    #[serde(default)]
    pub permit_limit: Option<u32>,
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub segments_per_window: Option<u32>,

    #[serde(default)]
    pub token_limit: Option<u32>,
    #[serde(default)]
    pub tokens_per_period: Option<u32>,
    #[serde(default)]
    pub replenishment_period_ms: Option<u64>,

    /// Requests allowed to wait per partition; 0 disables queuing
    #[serde(default)]
    pub queue_limit: usize,
    #[serde(default)]
    pub queue_order: QueueOrder,

    /// Partition key extractor: `global`, `remote_addr`, `route` or `header:<name>`
    #[serde(default = "default_partition_by")]
    pub partition_by: String,
}

fn default_partition_by() -> String {
    "global".to_string()
}

impl PolicyConfig {
    /// Build the runtime policy, checking that the fields `kind` needs are present.
    pub fn to_policy(&self) -> Result<Policy> {
        let limiter = match self.kind {
            StrategyKind::FixedWindow => LimiterOptions::FixedWindow {
                permit_limit: self.require("permit_limit", self.permit_limit)?,
                window: self.require_ms("window_ms", self.window_ms)?,
            },
            StrategyKind::SlidingWindow => LimiterOptions::SlidingWindow {
                permit_limit: self.require("permit_limit", self.permit_limit)?,
                window: self.require_ms("window_ms", self.window_ms)?,
                segments_per_window: self
                    .require("segments_per_window", self.segments_per_window)?,
            },
            StrategyKind::TokenBucket => LimiterOptions::TokenBucket {
                token_limit: self.require("token_limit", self.token_limit.or(self.permit_limit))?,
                tokens_per_period: self.require("tokens_per_period", self.tokens_per_period)?,
                replenishment_period: self
                    .require_ms("replenishment_period_ms", self.replenishment_period_ms)?,
            },
            StrategyKind::Concurrency => LimiterOptions::Concurrency {
                permit_limit: self.require("permit_limit", self.permit_limit)?,
            },
        };

        let partition_by: PartitionBy = self
            .partition_by
            .parse()
            .map_err(|e| FloodgateError::Config(format!("policy '{}': {}", self.name, e)))?;

        let policy = Policy::new(self.name.clone(), limiter)
            .with_queue(self.queue_limit, self.queue_order)
            .with_partitioner(partition_by);
        policy.validate()?;
        Ok(policy)
    }

    fn require<T>(&self, field: &str, value: Option<T>) -> Result<T> {
        value.ok_or_else(|| {
            FloodgateError::Config(format!(
                "policy '{}' ({}) is missing '{}'",
                self.name, self.kind, field
            ))
        })
    }

    fn require_ms(&self, field: &str, value: Option<u64>) -> Result<Duration> {
        self.require(field, value).map(Duration::from_millis)
    }
}

impl RateLimitConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse rate limit config: {}", e)))
    }

    /// Get the configuration for a named policy.
    pub fn get_policy(&self, name: &str) -> Option<&PolicyConfig> {
        self.policies.iter().find(|p| p.name == name)
    }

    /// Validate every policy and wire up the registry.
    pub fn into_registry(&self, clock: Arc<dyn Clock>) -> Result<PolicyRegistry> {
        let mut builder = PolicyRegistry::builder(clock);
        for config in &self.policies {
            builder = builder.register(config.to_policy()?)?;
        }
        if let Some(name) = &self.default_policy {
            builder = builder.default_policy(name.clone());
        }
        for route in &self.routes {
            builder = builder.route(route.path.clone(), route.policy.clone());
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::descriptor::RequestContext;

    const SAMPLE: &str = r#"
default_policy: Fixed
policies:
  - name: Fixed
    kind: fixed_window
    permit_limit: 4
    window_ms: 12000
    queue_limit: 2
  - name: Sliding
    kind: sliding_window
    permit_limit: 4
    window_ms: 12000
    segments_per_window: 2
    queue_limit: 2
  - name: Token
    kind: token_bucket
    token_limit: 4
    tokens_per_period: 4
    replenishment_period_ms: 12000
  - name: Concurrency
    kind: Concurrency
    permit_limit: 4
    queue_limit: 2
    queue_order: newest_first
    partition_by: remote_addr
routes:
  - path: /api/product
    policy: Sliding
"#;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new())
    }

    #[test]
    fn test_parse_sample() {
        let config = RateLimitConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.policies.len(), 4);
        assert_eq!(config.default_policy.as_deref(), Some("Fixed"));

        let concurrency = config.get_policy("Concurrency").unwrap();
        assert_eq!(concurrency.kind, StrategyKind::Concurrency);
        assert_eq!(concurrency.queue_order, QueueOrder::NewestFirst);

        let token = config.get_policy("Token").unwrap();
        assert_eq!(token.partition_by, "global");
        assert_eq!(token.queue_limit, 0);
    }

    #[test]
    fn test_into_registry() {
        let registry = RateLimitConfig::from_yaml(SAMPLE)
            .unwrap()
            .into_registry(clock())
            .unwrap();

        let ctx = RequestContext::new().with_route("/api/product");
        let policy = registry.resolve(&ctx).unwrap();
        assert_eq!(policy.name(), "Sliding");
        assert_eq!(
            *policy.policy().limiter(),
            LimiterOptions::SlidingWindow {
                permit_limit: 4,
                window: Duration::from_secs(12),
                segments_per_window: 2,
            }
        );
        assert_eq!(policy.policy().queue().limit, 2);

        let summary = registry.get("Concurrency").unwrap().policy().summary();
        assert_eq!(summary.partition_by, "remote_addr");
    }

    #[test]
    fn test_token_limit_falls_back_to_permit_limit() {
        let config = RateLimitConfig::from_yaml(
            r#"
policies:
  - name: Token
    kind: token_bucket
    permit_limit: 10
    tokens_per_period: 2
    replenishment_period_ms: 1000
"#,
        )
        .unwrap();

        let policy = config.policies[0].to_policy().unwrap();
        assert_eq!(
            *policy.limiter(),
            LimiterOptions::TokenBucket {
                token_limit: 10,
                tokens_per_period: 2,
                replenishment_period: Duration::from_secs(1),
            }
        );
    }

    #[test]
    fn test_missing_field_is_reported() {
        let config = RateLimitConfig::from_yaml(
            r#"
policies:
  - name: Sliding
    kind: sliding_window
    permit_limit: 4
    window_ms: 12000
"#,
        )
        .unwrap();

        let err = config.into_registry(clock()).unwrap_err();
        assert!(err.to_string().contains("segments_per_window"));
    }

    #[test]
    fn test_invalid_configurations() {
        let cases = [
            // zero limit
            "policies:\n  - {name: F, kind: fixed_window, permit_limit: 0, window_ms: 1000}\n",
            // unknown extractor
            "policies:\n  - {name: F, kind: concurrency, permit_limit: 1, partition_by: cookie}\n",
            // duplicate name
            "policies:\n  - {name: F, kind: concurrency, permit_limit: 1}\n  - {name: F, kind: concurrency, permit_limit: 2}\n",
            // unknown default
            "default_policy: Missing\npolicies:\n  - {name: F, kind: concurrency, permit_limit: 1}\n",
            // unknown route policy
            "policies:\n  - {name: F, kind: concurrency, permit_limit: 1}\nroutes:\n  - {path: /a, policy: G}\n",
        ];

        for yaml in cases {
            let config = RateLimitConfig::from_yaml(yaml).unwrap();
            assert!(config.into_registry(clock()).is_err(), "accepted: {}", yaml);
        }
    }

    #[test]
    fn test_unknown_kind_fails_to_parse() {
        let result = RateLimitConfig::from_yaml(
            "policies:\n  - {name: F, kind: leaky_bucket, permit_limit: 1}\n",
        );
        assert!(result.is_err());
    }
}
