use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the cache crate.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced by the cache store, the query result cache and the invalidator.
///
/// Shared-tier failures never reach the read/write paths: they are
/// logged and degrade to local-only operation. `Remote` only reaches callers of
/// operations that target the shared tier explicitly (`ping`, `clear_tier_shared`).
///
/// The type is `Clone` so that the outcome of one coalesced computation can be
/// handed to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Invalid cache key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("In-flight computation table is full ({capacity} entries)")]
    CapacityExceeded { capacity: usize },

    #[error("Computation for key {key:?} timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    #[error("Computation for key {key:?} was cancelled")]
    Cancelled { key: String },

    #[error("Computation failed: {0}")]
    Compute(Arc<anyhow::Error>),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shared tier error: {0}")]
    Remote(String),

    #[error("Rule limit reached ({max} rules)")]
    RuleLimit { max: usize },

    #[error("Rule already registered: {0}")]
    DuplicateRule(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CacheError {
    /// Create a new InvalidKey error
    pub fn invalid_key(key: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason,
        }
    }

    /// Wrap a factory or executor failure.
    ///
    /// The original error stays reachable through `anyhow::Error::downcast_ref`.
    pub fn compute(err: impl Into<anyhow::Error>) -> Self {
        Self::Compute(Arc::new(err.into()))
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl std::fmt::Display) -> Self {
        Self::Serialization(message.to_string())
    }

    /// Create a new Remote error
    pub fn remote(message: impl std::fmt::Display) -> Self {
        Self::Remote(message.to_string())
    }

    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// True for "we gave up waiting" outcomes, as opposed to upstream failures.
    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Cancelled { .. })
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidKey { .. } => ErrorCategory::Validation,
            Self::CapacityExceeded { .. } | Self::RuleLimit { .. } => ErrorCategory::Capacity,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Cancelled { .. } => ErrorCategory::Cancelled,
            Self::Compute(_) => ErrorCategory::Compute,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Remote(_) => ErrorCategory::Remote,
            Self::DuplicateRule(_) | Self::Configuration(_) => ErrorCategory::Configuration,
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

/// Error categories for monitoring and classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Capacity,
    Timeout,
    Cancelled,
    Compute,
    Serialization,
    Remote,
    Configuration,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Capacity => "capacity",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Compute => "compute",
            Self::Serialization => "serialization",
            Self::Remote => "remote",
            Self::Configuration => "configuration",
        }
    }
}
