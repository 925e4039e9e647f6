//! Shared (L2) tier.
//!
//! ## Architecture
//!
//! - **RedisStore**: network store shared by every instance (deadpool pool)
//! - **MemoryStore**: in-process store with the same semantics, used for
//!   single-node deployments and tests
//! - **Pub/Sub**: optional cross-instance local-tier eviction
//!
//! ## Graceful Degradation
//!
//! Every method reports failure through [`SharedStoreError`]; the cache store
//! logs those failures and keeps serving from the local tier.

pub mod memory;
pub mod pubsub;
pub mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::RedisConfig;

pub use memory::MemoryStore;
pub use pubsub::{InvalidationMessage, PubSubInvalidationListener};
pub use redis_store::RedisStore;

/// Failure of a shared-tier operation.
#[derive(Debug, Error)]
pub enum SharedStoreError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("shared tier connection error: {0}")]
    Connection(String),
}

pub type SharedResult<T> = std::result::Result<T, SharedStoreError>;

/// One step of a cursor-based scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next step; `0` means the scan is complete.
    pub cursor: u64,
    pub keys: Vec<String>,
}

/// Key/value store backing the shared tier.
///
/// Payloads are opaque strings (encoded [`crate::codec::CacheEntry`]). Keys are
/// physical keys, already carrying the store's prefix.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Short backend name used in logs and stats.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> SharedResult<Option<String>>;

    async fn set_with_expiry(&self, key: &str, payload: &str, ttl: Duration) -> SharedResult<()>;

    /// Delete a single key, returning whether it existed.
    async fn delete(&self, key: &str) -> SharedResult<bool>;

    /// Delete a batch of keys, returning how many existed.
    async fn delete_many(&self, keys: &[String]) -> SharedResult<u64>;

    /// One non-blocking cursor step over keys matching a MATCH pattern.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> SharedResult<ScanPage>;

    async fn exists(&self, key: &str) -> SharedResult<bool>;

    async fn ping(&self) -> SharedResult<()>;

    /// Origin id stamped on published invalidations, when the backend publishes.
    fn origin(&self) -> Option<&str> {
        None
    }

    /// Notify other instances that `keys` (logical keys) were removed.
    async fn publish_invalidation(&self, _keys: &[String]) -> SharedResult<()> {
        Ok(())
    }

    /// Release connections. Further calls may fail.
    async fn close(&self) {}
}

/// Create a shared store based on configuration.
///
/// ## Modes
///
/// - **Redis disabled**: returns `None` (local tier only)
/// - **Redis enabled**: connects to Redis, falls back to `None` on failure
///
/// Startup never fails because the shared tier is unreachable.
pub async fn create_shared_store(config: &RedisConfig) -> Option<Arc<dyn SharedStore>> {
    if !config.enabled {
        tracing::info!("Redis disabled, using local tier only");
        return None;
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let store = match RedisStore::connect(config) {
        Ok(store) => store,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to create Redis pool. Falling back to local tier.");
            return None;
        }
    };

    match store.ping().await {
        Ok(()) => {
            tracing::info!("Connected to Redis");
            Some(Arc::new(store))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to connect to Redis. Falling back to local tier.");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_redis_yields_no_store() {
        let config = RedisConfig::default();
        assert!(create_shared_store(&config).await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_redis_falls_back() {
        let config = RedisConfig {
            enabled: true,
            url: "redis://127.0.0.1:1".to_string(),
            timeout_ms: 200,
            ..Default::default()
        };
        assert!(create_shared_store(&config).await.is_none());
    }
}
