//! Error types for ionos-ddns.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for ionos-ddns.
pub type Result<T> = std::result::Result<T, DdnsError>;

/// Crate-level error types.
#[derive(Error, Debug)]
pub enum DdnsError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network/HTTP error.
    #[error("Network error: {0}")]
    Network(String),

    /// Every configured address-lookup endpoint failed.
    #[error("Address resolution failed: {0}")]
    Resolution(String),

    /// State could not be made durable.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<reqwest::Error> for DdnsError {
    fn from(e: reqwest::Error) -> Self {
        DdnsError::Network(e.to_string())
    }
}

impl From<toml::de::Error> for DdnsError {
    fn from(e: toml::de::Error) -> Self {
        DdnsError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for DdnsError {
    fn from(e: toml::ser::Error) -> Self {
        DdnsError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for DdnsError {
    fn from(e: serde_json::Error) -> Self {
        DdnsError::Serialization(e.to_string())
    }
}

/// Classified failure of a single provider update call.
///
/// Only [`UpdateError::RateLimited`] and [`UpdateError::Transient`] are
/// retried automatically; the rest need an operator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    /// Credential rejected (401/403).
    #[error("authentication rejected by provider (HTTP {status})")]
    Auth { status: u16 },

    /// Provider asked us to slow down (429).
    #[error("rate limited by provider{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// Zone or record does not exist at the provider.
    #[error("not found: {0}")]
    NotFound(String),

    /// Network failure, timeout or 5xx.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Any other rejected request.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {}s)", d.as_secs()))
        .unwrap_or_default()
}

impl UpdateError {
    /// Whether the reconciliation loop may retry automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpdateError::RateLimited { .. } | UpdateError::Transient(_)
        )
    }

    /// Provider-specified minimum wait, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            UpdateError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(e: reqwest::Error) -> Self {
        // Connection resets, timeouts and truncated bodies are all worth another try.
        UpdateError::Transient(e.to_string())
    }
}
