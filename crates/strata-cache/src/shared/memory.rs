//! In-process shared tier.
//!
//! Emulates the Redis semantics the cache store relies on (expiry, multi-key
//! delete, cursor scans with MATCH patterns) without a network hop. Besides
//! single-node deployments it is used to exercise degraded mode: the store can
//! be switched offline, and raw payloads can be written past the codec.
//!
//! Expired entries are dropped when read, every [`PRUNE_EVERY_WRITES`] writes,
//! and at the start of every scan, so the map stays bounded by the live set.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{ScanPage, SharedResult, SharedStore, SharedStoreError};
use crate::pattern::compile_store_pattern;

#[derive(Debug, Clone)]
struct StoredValue {
    payload: String,
    expires_at: Instant,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Writes between two full passes over the map that drop expired entries.
pub const PRUNE_EVERY_WRITES: u64 = 1024;

/// Scans not continued within this window are forgotten.
const SCAN_SESSION_TTL: Duration = Duration::from_secs(60);

/// Key snapshot taken when a scan starts. Cursors index into it, so keys
/// deleted between steps do not shift the remaining pages.
#[derive(Debug)]
struct ScanSession {
    keys: Arc<Vec<String>>,
    started: Instant,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    scans: DashMap<u64, ScanSession>,
    next_scan: AtomicU64,
    writes: AtomicU64,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails until switched back online.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Write a payload verbatim, bypassing the codec.
    pub fn insert_raw(&self, key: &str, payload: &str, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                payload: payload.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        if self.writes.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY_WRITES
            == PRUNE_EVERY_WRITES - 1
        {
            self.purge_expired();
        }
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, value| value.is_live(now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            tracing::debug!(purged, "memory store dropped expired entries");
        }
        purged
    }

    /// Raw payload of a live key.
    pub fn raw(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.payload.clone())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> SharedResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SharedStoreError::Connection("memory store is offline".into()));
        }
        Ok(())
    }

    fn remove_live(&self, key: &str, now: Instant) -> bool {
        self.entries
            .remove(key)
            .is_some_and(|(_, value)| value.is_live(now))
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> SharedResult<Option<String>> {
        self.check_online()?;
        let now = Instant::now();
        let value = self.entries.get(key).map(|v| v.clone());
        match value {
            Some(v) if v.is_live(now) => Ok(Some(v.payload)),
            Some(_) => {
                self.entries.remove_if(key, |_, v| !v.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_expiry(&self, key: &str, payload: &str, ttl: Duration) -> SharedResult<()> {
        self.check_online()?;
        self.insert_raw(key, payload, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> SharedResult<bool> {
        self.check_online()?;
        Ok(self.remove_live(key, Instant::now()))
    }

    async fn delete_many(&self, keys: &[String]) -> SharedResult<u64> {
        self.check_online()?;
        let now = Instant::now();
        Ok(keys.iter().filter(|k| self.remove_live(k, now)).count() as u64)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> SharedResult<ScanPage> {
        self.check_online()?;
        let matcher = compile_store_pattern(pattern)
            .map_err(|e| SharedStoreError::Command(e.to_string()))?;

        // Cursor layout: scan id in the high 32 bits, offset in the low 32.
        let (id, start, keys) = if cursor == 0 {
            self.scans
                .retain(|_, session| session.started.elapsed() < SCAN_SESSION_TTL);
            self.purge_expired();
            let mut all: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
            all.sort_unstable();
            let id = self.next_scan.fetch_add(1, Ordering::Relaxed) % u64::from(u32::MAX) + 1;
            let keys = Arc::new(all);
            self.scans.insert(
                id,
                ScanSession {
                    keys: Arc::clone(&keys),
                    started: Instant::now(),
                },
            );
            (id, 0usize, keys)
        } else {
            let id = cursor >> 32;
            let Some(keys) = self.scans.get(&id).map(|s| Arc::clone(&s.keys)) else {
                return Ok(ScanPage {
                    cursor: 0,
                    keys: Vec::new(),
                });
            };
            (id, (cursor & u64::from(u32::MAX)) as usize, keys)
        };

        let start = start.min(keys.len());
        let end = start.saturating_add(count.max(1)).min(keys.len());
        let now = Instant::now();
        let page = keys[start..end]
            .iter()
            .filter(|k| matcher.is_match(k))
            .filter(|k| self.entries.get(k.as_str()).is_some_and(|v| v.is_live(now)))
            .cloned()
            .collect();

        let cursor = if end >= keys.len() {
            self.scans.remove(&id);
            0
        } else {
            (id << 32) | end as u64
        };
        Ok(ScanPage { cursor, keys: page })
    }

    async fn exists(&self, key: &str) -> SharedResult<bool> {
        self.check_online()?;
        let now = Instant::now();
        Ok(self.entries.get(key).is_some_and(|v| v.is_live(now)))
    }

    async fn ping(&self) -> SharedResult<()> {
        self.check_online()
    }
}
