//! Request identity and partition key extraction.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::FloodgateError;

/// Key used when the request carries nothing to partition on.
pub const UNKNOWN_PARTITION: &str = "unknown";

/// Key shared by every request under a global partitioner.
pub const GLOBAL_PARTITION: &str = "*";

/// Identifies one isolated set of limiter state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey(Arc<str>);

impl PartitionKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PartitionKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for PartitionKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the limiter knows about an incoming request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Route or path the request targets
    pub route: Option<String>,
    /// Policy pinned by the route, overriding the route table
    pub policy: Option<String>,
    /// Address of the calling client
    pub remote_addr: Option<IpAddr>,
    /// Request headers, keyed by lowercase name
    pub headers: HashMap<String, String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Built-in ways to derive a partition key from a request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PartitionBy {
    /// Every request shares one partition.
    #[default]
    Global,
    /// One partition per client address.
    RemoteAddr,
    /// One partition per route.
    Route,
    /// One partition per value of the named header.
    Header(String),
}

impl PartitionBy {
    fn extract(&self, ctx: &RequestContext) -> PartitionKey {
        match self {
            PartitionBy::Global => PartitionKey::from(GLOBAL_PARTITION),
            PartitionBy::RemoteAddr => ctx
                .remote_addr
                .map(|addr| PartitionKey::from(addr.to_string()))
                .unwrap_or_else(|| PartitionKey::from(UNKNOWN_PARTITION)),
            PartitionBy::Route => PartitionKey::from(ctx.route.as_deref().unwrap_or("/")),
            PartitionBy::Header(name) => {
                PartitionKey::from(ctx.header(name).unwrap_or(UNKNOWN_PARTITION))
            }
        }
    }
}

impl FromStr for PartitionBy {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "global" => Ok(PartitionBy::Global),
            "remote_addr" | "client_ip" => Ok(PartitionBy::RemoteAddr),
            "route" => Ok(PartitionBy::Route),
            other => match other.split_once(':') {
                Some(("header", name)) if !name.trim().is_empty() => {
                    Ok(PartitionBy::Header(name.trim().to_ascii_lowercase()))
                }
                _ => Err(FloodgateError::Config(format!(
                    "unknown partition extractor '{}'",
                    other
                ))),
            },
        }
    }
}

impl fmt::Display for PartitionBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionBy::Global => f.write_str("global"),
            PartitionBy::RemoteAddr => f.write_str("remote_addr"),
            PartitionBy::Route => f.write_str("route"),
            PartitionBy::Header(name) => write!(f, "header:{}", name),
        }
    }
}

type ExtractFn = dyn Fn(&RequestContext) -> PartitionKey + Send + Sync;

/// Partition key extractor attached to a policy.
#[derive(Clone)]
pub struct Partitioner {
    description: String,
    extract: Arc<ExtractFn>,
}

impl Partitioner {
    /// Wrap a custom extraction function.
    pub fn from_fn<F>(description: impl Into<String>, extract: F) -> Self
    where
        F: Fn(&RequestContext) -> PartitionKey + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            extract: Arc::new(extract),
        }
    }

    pub fn partition_key(&self, ctx: &RequestContext) -> PartitionKey {
        (self.extract)(ctx)
    }

    /// Human readable name of the extractor.
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl From<PartitionBy> for Partitioner {
    fn from(by: PartitionBy) -> Self {
        let description = by.to_string();
        Self::from_fn(description, move |ctx| by.extract(ctx))
    }
}

impl Default for Partitioner {
    fn default() -> Self {
        PartitionBy::Global.into()
    }
}

impl fmt::Debug for Partitioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Partitioner").field(&self.description).finish()
    }
}
