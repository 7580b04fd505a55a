//! Error types for Floodgate.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Floodgate operations.
///
/// Every variant is a startup or serving failure. Per-request limiting outcomes are
/// reported through [`LimitError`] and never surface here.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Invalid policy parameters or registry wiring
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration sources that could not be read or merged
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// HTTP server failures
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;

/// Why a request was not admitted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimitError {
    /// No permit available and no room left in the queue
    #[error("rate limit exceeded")]
    LimitExceeded {
        /// Time until a permit is expected to free up, when known
        retry_after: Option<Duration>,
    },

    /// Waited in the queue longer than the configured bound
    #[error("queued request timed out after {waited:?}")]
    QueueTimeout {
        waited: Duration,
        retry_after: Option<Duration>,
    },

    /// The caller withdrew the request while it was queued
    #[error("queued request was cancelled")]
    Cancelled,
}

impl LimitError {
    /// Retry hint carried by the error, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LimitError::LimitExceeded { retry_after } => *retry_after,
            LimitError::QueueTimeout { retry_after, .. } => *retry_after,
            LimitError::Cancelled => None,
        }
    }
}
