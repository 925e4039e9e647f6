//! Redis-backed shared tier.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use redis::AsyncCommands;
use uuid::Uuid;

use super::pubsub::InvalidationMessage;
use super::{ScanPage, SharedResult, SharedStore, SharedStoreError};
use crate::config::RedisConfig;

/// Shared tier over a deadpool Redis connection pool.
///
/// TTLs are written with millisecond precision (`PSETEX`). Deletions can be
/// announced on a pub/sub channel so other instances evict their local copies;
/// every message carries this store's origin id so the local listener can
/// ignore its own announcements.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    url: String,
    channel: String,
    publish: bool,
    origin: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.url)
            .field("channel", &self.channel)
            .field("publish", &self.publish)
            .field("origin", &self.origin)
            .finish()
    }
}

impl RedisStore {
    /// Build the connection pool. No connection is attempted yet.
    pub fn connect(config: &RedisConfig) -> SharedResult<Self> {
        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(config.timeout());
        pool_config.timeouts.create = Some(config.timeout());
        pool_config.timeouts.recycle = Some(config.timeout());
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| SharedStoreError::Pool(e.to_string()))?;

        Ok(Self {
            pool,
            url: config.url.clone(),
            channel: config.channel.clone(),
            publish: config.pubsub,
            origin: Uuid::new_v4().to_string(),
        })
    }

    /// Identifier stamped on published invalidation messages.
    pub fn origin_id(&self) -> &str {
        &self.origin
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn conn(&self) -> SharedResult<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| SharedStoreError::Pool(e.to_string()))
    }
}

fn command_error(e: redis::RedisError) -> SharedStoreError {
    if e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        SharedStoreError::Connection(e.to_string())
    } else {
        SharedStoreError::Command(e.to_string())
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn origin(&self) -> Option<&str> {
        Some(&self.origin)
    }

    async fn get(&self, key: &str) -> SharedResult<Option<String>> {
        let mut conn = self.conn().await?;
        conn.get::<_, Option<String>>(key)
            .await
            .map_err(command_error)
    }

    async fn set_with_expiry(&self, key: &str, payload: &str, ttl: Duration) -> SharedResult<()> {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.conn().await?;
        conn.pset_ex::<_, _, ()>(key, payload, millis)
            .await
            .map_err(command_error)
    }

    async fn delete(&self, key: &str) -> SharedResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(key).await.map_err(command_error)?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> SharedResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        conn.del::<_, u64>(keys).await.map_err(command_error)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> SharedResult<ScanPage> {
        let mut conn = self.conn().await?;
        let (cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(ScanPage { cursor, keys })
    }

    async fn exists(&self, key: &str) -> SharedResult<bool> {
        let mut conn = self.conn().await?;
        conn.exists::<_, bool>(key).await.map_err(command_error)
    }

    async fn ping(&self) -> SharedResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn publish_invalidation(&self, keys: &[String]) -> SharedResult<()> {
        if !self.publish || keys.is_empty() {
            return Ok(());
        }
        let message = InvalidationMessage {
            origin: self.origin.clone(),
            keys: keys.to_vec(),
        };
        let payload = serde_json::to_string(&message)
            .map_err(|e| SharedStoreError::Command(e.to_string()))?;

        let mut conn = self.conn().await?;
        conn.publish::<_, _, ()>(&self.channel, payload)
            .await
            .map_err(command_error)?;
        tracing::debug!(count = keys.len(), channel = %self.channel, "published cache invalidation");
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
        tracing::debug!(url = %self.url, "Redis pool closed");
    }
}
