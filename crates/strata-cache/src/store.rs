//! Two-tier cache store.
//!
//! ## Cache Hierarchy
//!
//! ```text
//! get → local tier (moka) → shared tier (Redis/memory) → factory
//!            ↓                     ↓                        ↓
//!        in-process           promoted to local        written through both
//! ```
//!
//! ## Graceful Degradation
//!
//! Shared-tier failures never fail a read or a write: they are logged, counted,
//! and the store keeps serving from the local tier. Undecodable shared payloads
//! are treated as misses and deleted.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, CacheEntry};
use crate::config::StoreConfig;
use crate::error::{CacheError, Result};
use crate::inflight::{self, InFlightGuard, InFlightTable, Registration};
use crate::key::{validate_key, validate_keys};
use crate::local::LocalTier;
use crate::metrics;
use crate::pattern::{compile_glob, escape_store_literal, to_store_pattern};
use crate::shared::SharedStore;

/// Options for a plain write.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Defaults to the store's `default_ttl_ms`. A zero TTL removes the key.
    pub ttl: Option<Duration>,
    pub tags: Option<BTreeSet<String>>,
    pub etag: Option<String>,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }
}

/// Options for a coalesced computation.
#[derive(Debug, Clone, Default)]
pub struct ComputeOptions {
    pub ttl: Option<Duration>,
    /// Defaults to the store's `compute_timeout_ms`.
    pub timeout: Option<Duration>,
    /// Cancels the computation when this caller started it; otherwise only
    /// stops this caller from waiting.
    pub cancel: Option<CancellationToken>,
    pub tags: Option<BTreeSet<String>>,
    pub etag: Option<String>,
}

impl ComputeOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }
}

/// Point-in-time store statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub local_entries: u64,
    pub inflight_entries: usize,
    pub inflight_capacity: usize,
    /// Name of the shared backend, `None` when running local-only.
    pub shared_backend: Option<String>,
    pub key_prefix: String,
}

struct StoreInner {
    config: StoreConfig,
    local: LocalTier,
    shared: Option<Arc<dyn SharedStore>>,
    inflight: Arc<InFlightTable>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl StoreInner {
    fn physical_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    async fn lookup(&self, key: &str) -> Option<Arc<CacheEntry<Value>>> {
        if let Some(entry) = self.local.get(key).await {
            tracing::debug!(key = %key, "cache hit (local)");
            metrics::record_cache_hit("local");
            return Some(entry);
        }

        let Some(shared) = &self.shared else {
            metrics::record_cache_miss();
            return None;
        };

        let physical = self.physical_key(key);
        match shared.get(&physical).await {
            Ok(Some(payload)) => match codec::decode(&payload) {
                Ok(entry) => {
                    let promotion_ttl = match entry.remaining_at(codec::now_millis()) {
                        Some(remaining) if remaining.is_zero() => {
                            tracing::debug!(key = %key, "shared entry past its expiry, treating as miss");
                            metrics::record_cache_miss();
                            return None;
                        }
                        Some(remaining) => remaining.min(self.config.promotion_ttl()),
                        None => self.config.promotion_ttl(),
                    };
                    tracing::debug!(key = %key, "cache hit (shared)");
                    metrics::record_cache_hit("shared");
                    let entry = Arc::new(entry);
                    self.local
                        .insert(key, Arc::clone(&entry), promotion_ttl)
                        .await;
                    Some(entry)
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "corrupted shared entry, purging");
                    metrics::record_corrupted_entry();
                    if let Err(e) = shared.delete(&physical).await {
                        tracing::warn!(key = %key, error = %e, "failed to purge corrupted entry");
                        metrics::record_shared_error("delete");
                    }
                    metrics::record_cache_miss();
                    None
                }
            },
            Ok(None) => {
                tracing::debug!(key = %key, "cache miss");
                metrics::record_cache_miss();
                None
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "shared tier GET error");
                metrics::record_shared_error("get");
                metrics::record_cache_miss();
                None
            }
        }
    }

    async fn write(&self, key: &str, entry: CacheEntry<Value>, ttl: Duration) {
        if ttl.is_zero() {
            self.remove(key).await;
            return;
        }

        let entry = Arc::new(entry.expiring_after(ttl));
        self.local.insert(key, Arc::clone(&entry), ttl).await;
        metrics::set_local_entries(self.local.entry_count());

        let Some(shared) = &self.shared else {
            return;
        };
        let payload = match codec::encode(&entry) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to encode entry for shared tier");
                return;
            }
        };
        if let Err(e) = shared
            .set_with_expiry(&self.physical_key(key), &payload, ttl)
            .await
        {
            tracing::warn!(key = %key, error = %e, "shared tier SET error");
            metrics::record_shared_error("set");
        } else {
            tracing::debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "cache set (local+shared)");
        }
    }

    async fn remove(&self, key: &str) -> bool {
        let local = self.local.remove(key).await;
        let Some(shared) = &self.shared else {
            return local;
        };
        let remote = match shared.delete(&self.physical_key(key)).await {
            Ok(existed) => existed,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "shared tier DEL error");
                metrics::record_shared_error("delete");
                false
            }
        };
        self.publish(&[key.to_string()]).await;
        local || remote
    }

    async fn publish(&self, keys: &[String]) {
        if let Some(shared) = &self.shared
            && let Err(e) = shared.publish_invalidation(keys).await
        {
            tracing::warn!(error = %e, "failed to publish invalidation");
            metrics::record_shared_error("publish");
        }
    }
}

/// Cache store handle. Cloning is cheap; clones share both tiers.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("key_prefix", &self.inner.config.key_prefix)
            .field("local", &self.inner.local)
            .field("shared", &self.inner.shared.as_ref().map(|s| s.name()))
            .field("inflight", &self.inner.inflight)
            .finish()
    }
}

pub struct CacheStoreBuilder {
    config: StoreConfig,
    shared: Option<Arc<dyn SharedStore>>,
}

impl CacheStoreBuilder {
    pub fn shared(mut self, shared: Arc<dyn SharedStore>) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn shared_opt(mut self, shared: Option<Arc<dyn SharedStore>>) -> Self {
        self.shared = shared;
        self
    }

    /// Build the store. Inside a Tokio runtime this also starts the stale
    /// in-flight sweep.
    pub fn build(self) -> CacheStore {
        let inflight = InFlightTable::new(
            self.config.inflight_max_entries,
            self.config.inflight_grace(),
        );
        let mut tasks = Vec::new();
        if tokio::runtime::Handle::try_current().is_ok() {
            tasks.push(inflight::spawn_sweeper(
                &inflight,
                self.config.sweep_interval(),
            ));
        }

        CacheStore {
            inner: Arc::new(StoreInner {
                local: LocalTier::new(self.config.local_max_entries),
                shared: self.shared,
                inflight,
                tasks: Mutex::new(tasks),
                closed: AtomicBool::new(false),
                config: self.config,
            }),
        }
    }
}

impl CacheStore {
    pub fn builder(config: StoreConfig) -> CacheStoreBuilder {
        CacheStoreBuilder {
            config,
            shared: None,
        }
    }

    /// Local-only store with default settings.
    pub fn local() -> Self {
        Self::builder(StoreConfig::default()).build()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn local_tier(&self) -> &LocalTier {
        &self.inner.local
    }

    pub fn shared(&self) -> Option<&Arc<dyn SharedStore>> {
        self.inner.shared.as_ref()
    }

    /// Tie a background task to the store's lifetime.
    pub fn attach_task(&self, task: JoinHandle<()>) {
        self.inner.tasks.lock().push(task);
    }

    /// Read a value. Shared-tier hits are promoted to the local tier.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(entry) = self.get_entry(key).await? else {
            return Ok(None);
        };
        match entry.decode_value() {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cached value has unexpected shape, treating as miss");
                Ok(None)
            }
        }
    }

    /// Read the raw entry, including its etag and tags.
    pub async fn get_entry(&self, key: &str) -> Result<Option<Arc<CacheEntry<Value>>>> {
        validate_key(key)?;
        Ok(self.inner.lookup(key).await)
    }

    /// Cache-aside read without coalescing: every caller that misses runs `factory`.
    pub async fn get_with<T, F, Fut, E>(&self, key: &str, factory: F, opts: SetOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        if let Some(hit) = self.get(key).await? {
            return Ok(hit);
        }
        let value = factory().await.map_err(CacheError::compute)?;
        self.set(key, &value, opts).await?;
        Ok(value)
    }

    /// Stampede-protected read: concurrent misses for the same key share a
    /// single run of `factory`.
    ///
    /// The computation races `factory` against the timeout and the starting
    /// caller's cancellation token. A joining caller stops waiting on its own
    /// timeout or token while the computation keeps running for the others.
    /// Failures are never cached.
    pub async fn get_or_compute<T, F, Fut, E>(
        &self,
        key: &str,
        factory: F,
        opts: ComputeOptions,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        if let Some(hit) = self.get(key).await? {
            return Ok(hit);
        }

        let ttl = opts.ttl.unwrap_or_else(|| self.inner.config.default_ttl());
        let timeout = opts
            .timeout
            .unwrap_or_else(|| self.inner.config.compute_timeout());
        let token = opts
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let store = Arc::downgrade(&self.inner);
        let owned_key = key.to_string();
        let (tags, etag) = (opts.tags.clone(), opts.etag.clone());

        let registration = self
            .inner
            .inflight
            .join_or_register(key, token, move |guard, cancel| {
                let job = Computation {
                    store,
                    key: owned_key,
                    ttl,
                    timeout,
                    tags,
                    etag,
                };
                job.run(factory, guard, cancel).boxed().shared()
            })?;

        let outcome = match registration {
            Registration::Leader(computation) => computation.await,
            Registration::Joined(computation) => {
                let wait = async {
                    match opts.timeout {
                        Some(timeout) => tokio::time::timeout(timeout, computation)
                            .await
                            .unwrap_or_else(|_| {
                                metrics::record_compute_timeout();
                                Err(CacheError::Timeout { key: key.to_string(), timeout })
                            }),
                        None => computation.await,
                    }
                };
                match &opts.cancel {
                    Some(cancel) => tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(CacheError::Cancelled { key: key.to_string() }),
                        result = wait => result,
                    },
                    None => wait.await,
                }
            }
        };

        let value = outcome?;
        T::deserialize(&*value).map_err(CacheError::from)
    }

    /// Write-through: local tier first, then the shared tier.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, opts: SetOptions) -> Result<()> {
        validate_key(key)?;
        let entry = CacheEntry::from_typed(value)?
            .with_tags(opts.tags)
            .with_etag(opts.etag);
        let ttl = opts.ttl.unwrap_or_else(|| self.inner.config.default_ttl());
        self.inner.write(key, entry, ttl).await;
        Ok(())
    }

    /// Remove a key from both tiers. Returns whether either tier held it.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.inner.remove(key).await)
    }

    /// Remove many keys, batching shared-tier deletions.
    ///
    /// Returns the number of distinct keys removed from either tier. Keys the
    /// local tier held are deleted from the shared tier in their own batch, so
    /// only keys found solely in the shared tier add to the local count.
    pub async fn delete_many<S: AsRef<str>>(&self, keys: &[S]) -> Result<u64> {
        validate_keys(keys)?;
        let keys: Vec<String> = keys
            .iter()
            .map(|k| k.as_ref().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }

        let mut held_locally = Vec::new();
        let mut shared_only = Vec::new();
        for key in &keys {
            if self.inner.local.remove(key).await {
                held_locally.push(key);
            } else {
                shared_only.push(key);
            }
        }
        let local_removed = held_locally.len() as u64;

        let Some(shared) = &self.inner.shared else {
            return Ok(local_removed);
        };

        let batch_size = self.inner.config.delete_batch_size;
        for batch in held_locally.chunks(batch_size) {
            self.delete_shared_batch(shared.as_ref(), batch).await;
        }
        let mut shared_only_removed = 0u64;
        for batch in shared_only.chunks(batch_size) {
            shared_only_removed += self.delete_shared_batch(shared.as_ref(), batch).await;
        }
        self.inner.publish(&keys).await;

        tracing::debug!(
            requested = keys.len(),
            local_removed,
            shared_only_removed,
            "cache keys deleted"
        );
        Ok(local_removed + shared_only_removed)
    }

    async fn delete_shared_batch(&self, shared: &dyn SharedStore, batch: &[&String]) -> u64 {
        let physical: Vec<String> = batch.iter().map(|k| self.inner.physical_key(k)).collect();
        match shared.delete_many(&physical).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(batch = batch.len(), error = %e, "shared tier batch DEL error");
                metrics::record_shared_error("delete_many");
                0
            }
        }
    }

    /// Local tier first, then an EXISTS check against the shared tier.
    pub async fn has(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        if self.inner.local.get(key).await.is_some() {
            return Ok(true);
        }
        let Some(shared) = &self.inner.shared else {
            return Ok(false);
        };
        match shared.exists(&self.inner.physical_key(key)).await {
            Ok(exists) => Ok(exists),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "shared tier EXISTS error");
                metrics::record_shared_error("exists");
                Ok(false)
            }
        }
    }

    /// Empty the local tier and sweep the shared tier's prefix.
    ///
    /// Shared-tier failures are logged; the returned count covers what was
    /// removed from the shared tier.
    pub async fn clear_all(&self) -> Result<u64> {
        self.inner.local.clear();
        metrics::set_local_entries(0);
        if self.inner.shared.is_none() {
            return Ok(0);
        }
        match self.clear_tier_shared().await {
            Ok(removed) => Ok(removed),
            Err(e) => {
                tracing::warn!(error = %e, "failed to clear shared tier");
                Ok(0)
            }
        }
    }

    /// Cursor-scan the shared tier for this store's prefix and delete in batches.
    pub async fn clear_tier_shared(&self) -> Result<u64> {
        let Some(shared) = &self.inner.shared else {
            return Ok(0);
        };
        let config = &self.inner.config;
        let pattern = format!("{}*", escape_store_literal(&config.key_prefix));

        let mut cursor = 0u64;
        let mut batch: Vec<String> = Vec::with_capacity(config.delete_batch_size);
        let mut removed = 0u64;
        loop {
            let page = shared
                .scan(cursor, &pattern, config.scan_count)
                .await
                .map_err(CacheError::remote)?;
            for key in page.keys {
                batch.push(key);
                if batch.len() >= config.delete_batch_size {
                    removed += self.flush_batch(shared.as_ref(), &mut batch).await?;
                }
            }
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }
        if !batch.is_empty() {
            removed += self.flush_batch(shared.as_ref(), &mut batch).await?;
        }

        tracing::info!(removed, prefix = %config.key_prefix, "shared tier cleared");
        Ok(removed)
    }

    async fn flush_batch(&self, shared: &dyn SharedStore, batch: &mut Vec<String>) -> Result<u64> {
        let removed = shared
            .delete_many(batch.as_slice())
            .await
            .map_err(CacheError::remote)?;
        let prefix = &self.inner.config.key_prefix;
        let logical: Vec<String> = batch
            .drain(..)
            .filter_map(|k| k.strip_prefix(prefix.as_str()).map(str::to_string))
            .collect();
        self.inner.publish(&logical).await;
        Ok(removed)
    }

    /// Logical keys in the shared tier matching a key glob.
    pub async fn scan_shared(&self, glob: &str) -> Result<Vec<String>> {
        let Some(shared) = &self.inner.shared else {
            return Ok(Vec::new());
        };
        let matcher = compile_glob(glob)?;
        let config = &self.inner.config;
        let pattern = format!(
            "{}{}",
            escape_store_literal(&config.key_prefix),
            to_store_pattern(glob)
        );

        let mut cursor = 0u64;
        let mut keys = BTreeSet::new();
        loop {
            let page = shared
                .scan(cursor, &pattern, config.scan_count)
                .await
                .map_err(CacheError::remote)?;
            keys.extend(
                page.keys
                    .iter()
                    .filter_map(|k| k.strip_prefix(config.key_prefix.as_str()))
                    .filter(|k| matcher.is_match(k))
                    .map(str::to_string),
            );
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys.into_iter().collect())
    }

    /// Keys currently held by the local tier.
    pub fn local_keys(&self) -> Vec<String> {
        self.inner.local.keys()
    }

    /// Cancel the running computation for `key`; every waiter receives `Cancelled`.
    pub fn cancel_computation(&self, key: &str) -> bool {
        self.inner.inflight.cancel(key)
    }

    pub fn inflight_len(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Remove stale in-flight entries now instead of waiting for the sweep.
    pub fn sweep_inflight(&self) -> usize {
        self.inner.inflight.sweep_stale()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            local_entries: self.inner.local.entry_count(),
            inflight_entries: self.inner.inflight.len(),
            inflight_capacity: self.inner.inflight.capacity(),
            shared_backend: self.inner.shared.as_ref().map(|s| s.name().to_string()),
            key_prefix: self.inner.config.key_prefix.clone(),
        }
    }

    /// Check that the shared tier answers.
    pub async fn ping(&self) -> Result<()> {
        match &self.inner.shared {
            Some(shared) => shared.ping().await.map_err(CacheError::remote),
            None => Err(CacheError::remote("no shared tier configured")),
        }
    }

    pub async fn shared_available(&self) -> bool {
        self.ping().await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop background tasks, cancel running computations and close the shared tier.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.inflight.cancel_all();
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        if let Some(shared) = &self.inner.shared {
            shared.close().await;
        }
        tracing::info!("cache store closed");
    }
}

/// One coalesced computation: runs the factory under its deadline and writes
/// the result through both tiers.
struct Computation {
    store: Weak<StoreInner>,
    key: String,
    ttl: Duration,
    timeout: Duration,
    tags: Option<BTreeSet<String>>,
    etag: Option<String>,
}

impl Computation {
    async fn run<T, F, Fut, E>(
        self,
        factory: F,
        guard: InFlightGuard,
        cancel: CancellationToken,
    ) -> Result<Arc<Value>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        // Released after the result is written, so there is no window in which
        // neither the cache nor the in-flight table knows the key.
        let _guard = guard;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CacheError::Cancelled { key: self.key.clone() }),
            result = tokio::time::timeout(self.timeout, factory()) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(CacheError::compute(e)),
                Err(_) => {
                    metrics::record_compute_timeout();
                    Err(CacheError::Timeout { key: self.key.clone(), timeout: self.timeout })
                }
            },
        };

        let value = match outcome {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(key = %self.key, error = %e, category = e.category().as_str(), "computation did not produce a value");
                return Err(e);
            }
        };

        let entry = CacheEntry::from_typed(&value)?
            .with_tags(self.tags)
            .with_etag(self.etag);
        let shared_value = Arc::new(entry.value.clone());
        if let Some(store) = self.store.upgrade() {
            store.write(&self.key, entry, self.ttl).await;
        }
        Ok(shared_value)
    }
}
