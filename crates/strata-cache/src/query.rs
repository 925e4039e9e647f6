//! Query result cache.
//!
//! Caches the result of `(query text, parameters)` on top of [`CacheStore`],
//! scoped to the dependencies (tables) the query reads. Physical keys embed
//! the dependency group's version:
//!
//! ```text
//! qc:<sha256(canonical query, params)>:<group>:v<version>
//! ```
//!
//! Invalidating a table bumps the version of every group that contains it,
//! which orphans all entries written under the old version in O(groups).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use crate::codec::now_millis;
use crate::config::QueryCacheConfig;
use crate::error::{CacheError, Result};
use crate::store::{CacheStore, SetOptions, StoreStats};
use crate::version::{VersionGroup, VersionMap, group_key};

/// Prefix of every query result key.
pub const QUERY_KEY_PREFIX: &str = "qc:";

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Defaults to the query cache's `default_ttl_ms`.
    pub ttl: Option<Duration>,
    /// Dependency names (usually tables) the result is derived from.
    pub depends_on: Vec<String>,
    /// Bypass the read and refresh the cached result.
    pub skip_cache: bool,
    /// Do not cache results that carry a truthy `error` field.
    pub cache_success_only: bool,
}

impl QueryOptions {
    pub fn depends_on<I, S>(depends_on: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            depends_on: depends_on.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub fn cache_success_only(mut self) -> Self {
        self.cache_success_only = true;
        self
    }
}

/// Result of [`QueryResultCache::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
    pub data: T,
    /// True when served from the cache.
    pub hit: bool,
    /// Milliseconds since the epoch when the result was produced.
    pub cached_at: u64,
    pub expires_at: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredResult {
    data: Value,
    cached_at: u64,
    expires_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub uncached_failures: u64,
    pub version_groups: usize,
    pub max_version_groups: usize,
    pub groups: Vec<VersionGroup>,
    pub store: StoreStats,
}

/// Derive the deterministic key of a query.
///
/// Whitespace runs collapse to one space; case is preserved because literals
/// inside queries compare case-sensitively.
pub fn query_key<P: Serialize + ?Sized>(query: &str, params: &P) -> Result<String> {
    let canonical = query.split_whitespace().collect::<Vec<_>>().join(" ");
    let params = serde_json::to_string(&serde_json::to_value(params)?)?;

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update([0u8]);
    hasher.update(params.as_bytes());
    Ok(format!("{QUERY_KEY_PREFIX}{}", hex::encode(hasher.finalize())))
}

/// True for objects carrying a truthy `error` field.
fn looks_like_failure(value: &Value) -> bool {
    match value.get("error") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

#[derive(Clone)]
pub struct QueryResultCache {
    store: CacheStore,
    versions: Arc<VersionMap>,
    config: QueryCacheConfig,
    counters: Arc<Counters>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    uncached_failures: AtomicU64,
}

impl std::fmt::Debug for QueryResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResultCache")
            .field("version_groups", &self.versions.len())
            .field("store", &self.store)
            .finish()
    }
}

impl QueryResultCache {
    /// Create the cache. Inside a Tokio runtime this also starts the idle
    /// version-group sweep.
    pub fn new(store: CacheStore, config: QueryCacheConfig) -> Self {
        let versions = Arc::new(VersionMap::new(
            config.max_version_groups,
            config.max_version,
        ));
        let mut tasks = Vec::new();
        if tokio::runtime::Handle::try_current().is_ok() {
            tasks.push(spawn_version_sweeper(
                Arc::downgrade(&versions),
                config.version_sweep_interval(),
                config.version_idle(),
            ));
        }
        Self {
            store,
            versions,
            config,
            counters: Arc::new(Counters::default()),
            tasks: Arc::new(Mutex::new(tasks)),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn key<P: Serialize + ?Sized>(&self, query: &str, params: &P) -> Result<String> {
        query_key(query, params)
    }

    /// Physical key of a query result under the current version of its group.
    pub fn versioned_key<P: Serialize + ?Sized>(
        &self,
        query: &str,
        params: &P,
        depends_on: &[String],
    ) -> Result<String> {
        let base = query_key(query, params)?;
        let group = group_key(depends_on);
        let version = self.versions.current(&group);
        Ok(format!("{base}:{group}:v{version}"))
    }

    /// Run `executor` unless a current result is cached.
    pub async fn execute<P, T, F, Fut, E>(
        &self,
        query: &str,
        params: &P,
        executor: F,
        opts: QueryOptions,
    ) -> Result<QueryResult<T>>
    where
        P: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let key = self.versioned_key(query, params, &opts.depends_on)?;

        if !opts.skip_cache
            && let Some(stored) = self.store.get::<StoredResult>(&key).await?
            && stored.expires_at > now_millis()
        {
            match T::deserialize(&stored.data) {
                Ok(data) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(QueryResult {
                        data,
                        hit: true,
                        cached_at: stored.cached_at,
                        expires_at: stored.expires_at,
                    });
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "cached query result has unexpected shape");
                }
            }
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let data = executor().await.map_err(CacheError::compute)?;
        let ttl = opts.ttl.unwrap_or_else(|| self.config.default_ttl());
        let cached_at = now_millis();
        let expires_at = cached_at.saturating_add(ttl.as_millis() as u64);

        let value = serde_json::to_value(&data)?;
        if opts.cache_success_only && looks_like_failure(&value) {
            tracing::debug!(key = %key, "query result flagged as failure, not caching");
            self.counters.uncached_failures.fetch_add(1, Ordering::Relaxed);
        } else {
            let stored = StoredResult {
                data: value,
                cached_at,
                expires_at,
            };
            self.store.set(&key, &stored, SetOptions::ttl(ttl)).await?;
        }

        Ok(QueryResult {
            data,
            hit: false,
            cached_at,
            expires_at,
        })
    }

    /// Invalidate every cached result depending on `name`.
    ///
    /// Returns the number of version groups bumped (or seeded).
    pub fn invalidate_table(&self, name: &str) -> usize {
        let bumped = self.versions.bump(name);
        tracing::debug!(table = %name, groups = bumped, "invalidated query results by dependency");
        bumped
    }

    /// Delete one query's cached result under every known dependency group.
    pub async fn invalidate_query<P: Serialize + ?Sized>(&self, query: &str, params: &P) -> Result<u64> {
        let base = query_key(query, params)?;
        let keys: Vec<String> = self
            .versions
            .snapshot()
            .into_iter()
            .map(|g| format!("{base}:{}:v{}", g.group, g.version))
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }
        self.store.delete_many(&keys).await
    }

    /// Run the idle-group sweep now.
    pub fn sweep_versions(&self) -> usize {
        self.versions.sweep_idle(self.config.version_idle())
    }

    pub fn stats(&self) -> QueryCacheStats {
        QueryCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            uncached_failures: self.counters.uncached_failures.load(Ordering::Relaxed),
            version_groups: self.versions.len(),
            max_version_groups: self.config.max_version_groups,
            groups: self.versions.snapshot(),
            store: self.store.stats(),
        }
    }

    /// Stop the version sweep. The underlying store is left open.
    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn spawn_version_sweeper(
    versions: Weak<VersionMap>,
    every: Duration,
    idle: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            match versions.upgrade() {
                Some(versions) => {
                    versions.sweep_idle(idle);
                }
                None => break,
            }
        }
    })
}
