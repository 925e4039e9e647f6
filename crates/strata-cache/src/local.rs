//! Local (L1) tier: bounded, in-process, per-entry TTL.
//!
//! Backed by a moka LRU cache. Each entry carries its own TTL through a custom
//! [`Expiry`] policy; reads additionally re-check the insertion time so that an
//! entry is never served past its lifetime even before moka's housekeeping runs.
//!
//! The lifetime is measured from insertion into this tier. A value promoted
//! from the shared tier is inserted with the smaller of the promotion TTL and
//! what is left of its own expiry, so it never outlives the shared copy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use serde_json::Value;

use crate::codec::CacheEntry;

/// An entry as held by the local tier.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub entry: Arc<CacheEntry<Value>>,
    pub ttl: Duration,
    pub inserted_at: Instant,
}

impl LocalEntry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

struct PerEntryTtl;

impl Expiry<String, LocalEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &LocalEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &LocalEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Local tier handle. Cloning is cheap and shares the underlying cache.
#[derive(Clone)]
pub struct LocalTier {
    cache: Cache<String, LocalEntry>,
}

impl std::fmt::Debug for LocalTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTier")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl LocalTier {
    pub fn new(max_entries: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_entries)
                .eviction_policy(EvictionPolicy::lru())
                .expire_after(PerEntryTtl)
                .build(),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<CacheEntry<Value>>> {
        let local = self.cache.get(key).await?;
        if local.is_expired() {
            self.cache.invalidate(key).await;
            return None;
        }
        Some(local.entry)
    }

    pub async fn insert(&self, key: &str, entry: Arc<CacheEntry<Value>>, ttl: Duration) {
        self.cache
            .insert(
                key.to_string(),
                LocalEntry {
                    entry,
                    ttl,
                    inserted_at: Instant::now(),
                },
            )
            .await;
    }

    /// Remove a key, returning whether a live entry was present.
    pub async fn remove(&self, key: &str) -> bool {
        self.cache
            .remove(key)
            .await
            .is_some_and(|local| !local.is_expired())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// Snapshot of the keys currently held.
    pub fn keys(&self) -> Vec<String> {
        self.cache
            .iter()
            .filter(|(_, local)| !local.is_expired())
            .map(|(key, _)| key.as_ref().clone())
            .collect()
    }

    /// Approximate entry count (moka applies writes lazily).
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Apply pending evictions so that counts are exact.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}
