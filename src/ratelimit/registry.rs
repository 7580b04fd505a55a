//! Policy registry: resolves which policy, and which limiter, applies to a request.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::descriptor::RequestContext;
use super::limiter::PartitionedLimiter;
use super::policy::Policy;
use crate::error::{FloodgateError, Result};

/// A policy together with the limiter holding its partitions.
#[derive(Debug)]
pub struct RegisteredPolicy {
    policy: Policy,
    limiter: Arc<PartitionedLimiter>,
}

impl RegisteredPolicy {
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn limiter(&self) -> &Arc<PartitionedLimiter> {
        &self.limiter
    }

    pub fn name(&self) -> &str {
        self.policy.name()
    }
}

/// Immutable set of named policies, a default and per-route overrides.
///
/// Built once at startup; every wiring mistake surfaces from
/// [`PolicyRegistryBuilder::build`] or [`PolicyRegistryBuilder::register`].
pub struct PolicyRegistry {
    policies: HashMap<String, RegisteredPolicy>,
    default_policy: Option<String>,
    routes: HashMap<String, String>,
    clock: Arc<dyn Clock>,
}

impl PolicyRegistry {
    pub fn builder(clock: Arc<dyn Clock>) -> PolicyRegistryBuilder {
        PolicyRegistryBuilder {
            clock,
            policies: Vec::new(),
            default_policy: None,
            routes: Vec::new(),
        }
    }

    /// Pick the policy for a request.
    ///
    /// Order: policy pinned on the request, then the route table, then the
    /// default. `None` means the request is not limited.
    pub fn resolve(&self, ctx: &RequestContext) -> Option<&RegisteredPolicy> {
        if let Some(name) = ctx.policy.as_deref() {
            match self.policies.get(name) {
                Some(policy) => return Some(policy),
                None => warn!(policy = %name, "Request names an unknown policy, falling back"),
            }
        }

        if let Some(route) = ctx.route.as_deref() {
            if let Some(policy) = self.routes.get(route).and_then(|name| self.policies.get(name)) {
                return Some(policy);
            }
        }

        self.default_policy
            .as_deref()
            .and_then(|name| self.policies.get(name))
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredPolicy> {
        self.policies.get(name)
    }

    pub fn default_policy(&self) -> Option<&str> {
        self.default_policy.as_deref()
    }

    /// Policy name bound to `route`, if any.
    pub fn route_policy(&self, route: &str) -> Option<&str> {
        self.routes.get(route).map(String::as_str)
    }

    /// Registered policies in name order.
    pub fn policies(&self) -> Vec<&RegisteredPolicy> {
        let mut policies: Vec<&RegisteredPolicy> = self.policies.values().collect();
        policies.sort_by(|a, b| a.name().cmp(b.name()));
        policies
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Admit queued waiters across every time-driven policy. Returns the
    /// number admitted.
    ///
    /// Concurrency limiters are skipped: their waiters are admitted by the
    /// release that frees the slot.
    pub fn process_queues(&self) -> usize {
        self.policies
            .values()
            .filter(|registered| {
                registered
                    .limiter
                    .options()
                    .replenishment_interval()
                    .is_some()
            })
            .map(|registered| registered.limiter.process_queues())
            .sum()
    }
}

impl std::fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("policies", &self.policies)
            .field("default_policy", &self.default_policy)
            .field("routes", &self.routes)
            .finish()
    }
}

/// Collects policies and wiring before freezing them into a [`PolicyRegistry`].
pub struct PolicyRegistryBuilder {
    clock: Arc<dyn Clock>,
    policies: Vec<Policy>,
    default_policy: Option<String>,
    routes: Vec<(String, String)>,
}

impl PolicyRegistryBuilder {
    /// Add a policy. Invalid parameters and duplicate names are rejected.
    pub fn register(mut self, policy: Policy) -> Result<Self> {
        policy.validate()?;
        if self.policies.iter().any(|p| p.name() == policy.name()) {
            return Err(FloodgateError::Config(format!(
                "policy '{}' is registered more than once",
                policy.name()
            )));
        }
        self.policies.push(policy);
        Ok(self)
    }

    /// Policy applied when no route override or pinned policy matches.
    pub fn default_policy(mut self, name: impl Into<String>) -> Self {
        self.default_policy = Some(name.into());
        self
    }

    /// Bind a route to a named policy.
    pub fn route(mut self, route: impl Into<String>, policy: impl Into<String>) -> Self {
        self.routes.push((route.into(), policy.into()));
        self
    }

    pub fn build(self) -> Result<PolicyRegistry> {
        let known = |name: &str| self.policies.iter().any(|p| p.name() == name);

        if let Some(name) = self.default_policy.as_deref() {
            if !known(name) {
                return Err(FloodgateError::Config(format!(
                    "default policy '{}' is not registered",
                    name
                )));
            }
        }

        let mut routes = HashMap::with_capacity(self.routes.len());
        for (route, policy) in &self.routes {
            if !known(policy) {
                return Err(FloodgateError::Config(format!(
                    "route '{}' refers to unknown policy '{}'",
                    route, policy
                )));
            }
            if routes.insert(route.clone(), policy.clone()).is_some() {
                return Err(FloodgateError::Config(format!(
                    "route '{}' is bound more than once",
                    route
                )));
            }
        }

        let mut policies = HashMap::with_capacity(self.policies.len());
        for policy in self.policies {
            let limiter = PartitionedLimiter::new(
                policy.name(),
                *policy.limiter(),
                policy.queue(),
                Arc::clone(&self.clock),
            );
            debug!(policy = %policy.name(), kind = %policy.limiter().kind(), "Registered policy");
            policies.insert(
                policy.name().to_string(),
                RegisteredPolicy {
                    policy,
                    limiter: Arc::new(limiter),
                },
            );
        }

        info!(
            policies = policies.len(),
            routes = routes.len(),
            default_policy = ?self.default_policy,
            "Policy registry ready"
        );

        Ok(PolicyRegistry {
            policies,
            default_policy: self.default_policy,
            routes,
            clock: self.clock,
        })
    }
}
