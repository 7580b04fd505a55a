//! Configuration management for Floodgate.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::RateLimitConfig;

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Gate behaviour shared by every policy
    #[serde(default)]
    pub gate: GateConfig,

    /// Policies, default policy and route overrides
    #[serde(default)]
    pub limits: RateLimitConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Upper bound on time spent in a wait queue; unbounded when unset
    #[serde(default)]
    pub queue_timeout_ms: Option<u64>,

    /// Tick of the background task that admits queued requests
    #[serde(default = "default_replenish_interval")]
    pub replenish_interval_ms: u64,

    /// Quiet time before a partition may be evicted
    #[serde(default = "default_idle_eviction")]
    pub idle_eviction_secs: u64,

    /// How often idle partitions are swept
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            queue_timeout_ms: None,
            replenish_interval_ms: default_replenish_interval(),
            idle_eviction_secs: default_idle_eviction(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_replenish_interval() -> u64 {
    100
}

fn default_idle_eviction() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

impl GateConfig {
    pub fn queue_timeout(&self) -> Option<Duration> {
        self.queue_timeout_ms.map(Duration::from_millis)
    }

    pub fn replenish_interval(&self) -> Duration {
        Duration::from_millis(self.replenish_interval_ms)
    }

    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl FloodgateConfig {
    /// Load configuration from a file, overlaid with `FLOODGATE__*`
    /// environment variables (for example `FLOODGATE__SERVER__HTTP_ADDR`).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("FLOODGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Load configuration from a YAML file without environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| FloodgateError::Config(e.to_string()))
    }
}
