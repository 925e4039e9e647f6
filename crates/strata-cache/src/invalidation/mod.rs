//! Rule-based invalidation.
//!
//! Rules tie tags to key globs. Tags reach the invalidator either directly
//! (`invalidate_by_tags`) or through domain events, which are evaluated as they
//! arrive or queued on a bounded FIFO when auto-invalidation is off.

pub mod event;
pub mod rule;

use std::collections::{BTreeSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{InvalidatorConfig, OverflowPolicy};
use crate::error::{CacheError, Result};
use crate::key::validate_key;
use crate::metrics;
use crate::pattern::{compile_glob, is_literal};
use crate::store::CacheStore;

pub use event::InvalidationEvent;
pub use rule::{InvalidationRule, RuleCondition};

#[derive(Debug, Clone, Default, Serialize)]
pub struct InvalidatorStats {
    pub rules: usize,
    pub queue_len: usize,
    pub queue_capacity: usize,
    pub events_processed: u64,
    pub events_queued: u64,
    pub events_dropped_oldest: u64,
    pub events_dropped_newest: u64,
    pub keys_invalidated: u64,
    pub rule_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    events_processed: AtomicU64,
    events_queued: AtomicU64,
    dropped_oldest: AtomicU64,
    dropped_newest: AtomicU64,
    keys_invalidated: AtomicU64,
    rule_failures: AtomicU64,
}

struct InvalidatorInner {
    store: CacheStore,
    config: InvalidatorConfig,
    /// Kept sorted by descending priority; ties keep registration order.
    rules: RwLock<Vec<Arc<InvalidationRule>>>,
    queue: Mutex<VecDeque<InvalidationEvent>>,
    draining: AtomicBool,
    counters: Counters,
}

/// Invalidator handle. Cloning is cheap.
#[derive(Clone)]
pub struct Invalidator {
    inner: Arc<InvalidatorInner>,
}

impl std::fmt::Debug for Invalidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invalidator")
            .field("rules", &self.inner.rules.read().len())
            .field("queue_len", &self.queue_len())
            .field("auto_invalidate", &self.inner.config.auto_invalidate)
            .finish()
    }
}

/// Clears the draining flag even if a drain is dropped midway.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Invalidator {
    pub fn new(store: CacheStore, config: InvalidatorConfig) -> Self {
        Self {
            inner: Arc::new(InvalidatorInner {
                store,
                queue: Mutex::new(VecDeque::with_capacity(config.queue_capacity.min(1024))),
                config,
                rules: RwLock::new(Vec::new()),
                draining: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn register_rule(&self, rule: InvalidationRule) -> Result<()> {
        for pattern in &rule.key_patterns {
            compile_glob(pattern)?;
        }

        let mut rules = self.inner.rules.write();
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(CacheError::DuplicateRule(rule.id));
        }
        if rules.len() >= self.inner.config.max_rules {
            return Err(CacheError::RuleLimit {
                max: self.inner.config.max_rules,
            });
        }
        let position = rules
            .iter()
            .position(|r| r.priority < rule.priority)
            .unwrap_or(rules.len());
        tracing::debug!(rule = %rule.id, priority = rule.priority, "registered invalidation rule");
        rules.insert(position, Arc::new(rule));
        Ok(())
    }

    pub fn unregister_rule(&self, id: &str) -> bool {
        let mut rules = self.inner.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        before != rules.len()
    }

    /// Registered rule ids, highest priority first.
    pub fn rule_ids(&self) -> Vec<String> {
        self.inner.rules.read().iter().map(|r| r.id.clone()).collect()
    }

    fn rules_snapshot(&self) -> Vec<Arc<InvalidationRule>> {
        self.inner.rules.read().clone()
    }

    /// Delete the keys of every rule whose tags intersect `tags`.
    ///
    /// Returns the number of keys actually deleted.
    pub async fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> Result<u64> {
        let tags: BTreeSet<String> = tags.iter().map(|t| t.as_ref().to_string()).collect();
        let mut deleted = 0;
        for rule in self.rules_snapshot() {
            if !rule.matches_tags(&tags) {
                continue;
            }
            deleted += self.apply_patterns(&rule, &rule.key_patterns).await;
        }
        metrics::record_keys_invalidated("tags", deleted as usize);
        self.inner
            .counters
            .keys_invalidated
            .fetch_add(deleted, Ordering::Relaxed);
        tracing::debug!(?tags, deleted, "invalidated by tags");
        Ok(deleted)
    }

    /// Delete every key matching a glob (`*` any sequence, `?` one character).
    pub async fn invalidate_by_pattern(&self, glob: &str) -> Result<u64> {
        let keys = self.matching_keys(glob).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = keys.into_iter().collect();
        let deleted = self.inner.store.delete_many(&keys).await?;
        metrics::record_keys_invalidated("pattern", deleted as usize);
        self.inner
            .counters
            .keys_invalidated
            .fetch_add(deleted, Ordering::Relaxed);
        tracing::debug!(pattern = %glob, deleted, "invalidated by pattern");
        Ok(deleted)
    }

    /// Keys currently cached that match `glob`, from the local tier and, when
    /// configured, the shared tier.
    pub async fn matching_keys(&self, glob: &str) -> Result<BTreeSet<String>> {
        if is_literal(glob) {
            return Ok(if validate_key(glob).is_ok() {
                BTreeSet::from([glob.to_string()])
            } else {
                BTreeSet::new()
            });
        }

        let matcher = compile_glob(glob)?;
        let mut keys: BTreeSet<String> = self
            .inner
            .store
            .local_keys()
            .into_iter()
            .filter(|k| matcher.is_match(k))
            .collect();

        if self.inner.config.include_shared && self.inner.store.shared().is_some() {
            match self.inner.store.scan_shared(glob).await {
                Ok(shared) => keys.extend(shared),
                Err(e) => {
                    tracing::warn!(pattern = %glob, error = %e, "shared tier scan failed, using local keys only");
                }
            }
        }
        keys.retain(|k| validate_key(k).is_ok());
        Ok(keys)
    }

    /// Evaluate the patterns of one rule, logging failures instead of returning them.
    async fn apply_patterns(&self, rule: &InvalidationRule, patterns: &[String]) -> u64 {
        let mut keys = BTreeSet::new();
        for pattern in patterns {
            match self.matching_keys(pattern).await {
                Ok(matched) => keys.extend(matched),
                Err(e) => {
                    self.record_rule_failure(&rule.id, &e);
                }
            }
        }
        if keys.is_empty() {
            return 0;
        }
        let keys: Vec<String> = keys.into_iter().collect();
        match self.inner.store.delete_many(&keys).await {
            Ok(deleted) => deleted,
            Err(e) => {
                self.record_rule_failure(&rule.id, &e);
                0
            }
        }
    }

    fn record_rule_failure(&self, rule: &str, error: &dyn std::fmt::Display) {
        tracing::warn!(rule = %rule, error = %error, "invalidation rule failed");
        self.inner
            .counters
            .rule_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Evaluate an event now, or queue it when auto-invalidation is off.
    ///
    /// Returns the number of keys deleted (always 0 when queued).
    pub async fn process_event(&self, event: InvalidationEvent) -> Result<u64> {
        if self.inner.config.auto_invalidate {
            Ok(self.evaluate(&event).await)
        } else {
            self.enqueue(event);
            Ok(0)
        }
    }

    async fn evaluate(&self, event: &InvalidationEvent) -> u64 {
        let tags = event.tags();
        let mut deleted = 0;
        for rule in self.rules_snapshot() {
            if !rule.matches_tags(&tags) {
                continue;
            }
            if let Some(condition) = &rule.condition {
                match catch_unwind(AssertUnwindSafe(|| condition(event))) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(_) => {
                        self.record_rule_failure(&rule.id, &"condition panicked");
                        continue;
                    }
                }
            }
            let patterns = rule.resolve_patterns(event);
            deleted += self.apply_patterns(&rule, &patterns).await;
        }

        self.inner
            .counters
            .events_processed
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .counters
            .keys_invalidated
            .fetch_add(deleted, Ordering::Relaxed);
        metrics::record_keys_invalidated("event", deleted as usize);
        tracing::debug!(
            event_type = %event.event_type,
            entity_type = %event.entity_type,
            deleted,
            "processed invalidation event"
        );
        deleted
    }

    fn enqueue(&self, event: InvalidationEvent) {
        let capacity = self.inner.config.queue_capacity;
        let mut queue = self.inner.queue.lock();
        if queue.len() >= capacity {
            match self.inner.config.overflow_policy {
                OverflowPolicy::DropOldest => {
                    queue.pop_front();
                    self.inner
                        .counters
                        .dropped_oldest
                        .fetch_add(1, Ordering::Relaxed);
                    metrics::record_event_dropped("drop_oldest");
                    tracing::warn!(capacity, "invalidation queue full, dropped oldest event");
                }
                OverflowPolicy::DropNewest => {
                    self.inner
                        .counters
                        .dropped_newest
                        .fetch_add(1, Ordering::Relaxed);
                    metrics::record_event_dropped("drop_newest");
                    tracing::warn!(capacity, "invalidation queue full, dropped incoming event");
                    return;
                }
            }
        }
        queue.push_back(event);
        self.inner
            .counters
            .events_queued
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Drain the queue sequentially. A call made while another drain is
    /// running returns immediately with 0.
    ///
    /// Returns the number of events processed.
    pub async fn process_queue(&self) -> u64 {
        if self.inner.draining.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let _guard = DrainGuard(&self.inner.draining);

        let mut processed = 0;
        loop {
            let next = self.inner.queue.lock().pop_front();
            let Some(event) = next else {
                break;
            };
            self.evaluate(&event).await;
            processed += 1;
        }
        processed
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Feed events from a broadcast channel until it closes.
    pub fn spawn_listener(&self, mut receiver: broadcast::Receiver<InvalidationEvent>) -> JoinHandle<()> {
        let invalidator = self.clone();
        tokio::spawn(async move {
            tracing::info!("invalidation event listener started");
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if let Err(e) = invalidator.process_event(event).await {
                            tracing::warn!(error = %e, "failed to process invalidation event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "invalidation listener lagged, events skipped");
                        invalidator
                            .inner
                            .counters
                            .dropped_oldest
                            .fetch_add(skipped, Ordering::Relaxed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::info!("invalidation event listener stopped");
        })
    }

    pub fn stats(&self) -> InvalidatorStats {
        let counters = &self.inner.counters;
        InvalidatorStats {
            rules: self.inner.rules.read().len(),
            queue_len: self.queue_len(),
            queue_capacity: self.inner.config.queue_capacity,
            events_processed: counters.events_processed.load(Ordering::Relaxed),
            events_queued: counters.events_queued.load(Ordering::Relaxed),
            events_dropped_oldest: counters.dropped_oldest.load(Ordering::Relaxed),
            events_dropped_newest: counters.dropped_newest.load(Ordering::Relaxed),
            keys_invalidated: counters.keys_invalidated.load(Ordering::Relaxed),
            rule_failures: counters.rule_failures.load(Ordering::Relaxed),
        }
    }
}
