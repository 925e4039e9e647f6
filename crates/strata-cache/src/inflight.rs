//! In-flight computation table.
//!
//! Holds at most one running computation per key. New callers for the same key
//! join the running computation instead of starting their own, as long as it is
//! younger than the grace period. The table is bounded: when full, one stale
//! entry is reclaimed, otherwise registration is refused.
//!
//! Entries are removed by an [`InFlightGuard`] owned by the computation future
//! itself, so removal happens when the computation completes or is dropped. The
//! guard only removes the entry it registered: a newer computation that replaced
//! a stale one under the same key is left untouched.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, Result};
use crate::metrics;

/// A computation shared between every caller waiting on the same key.
pub type SharedComputation = Shared<BoxFuture<'static, Result<Arc<Value>>>>;

struct InFlightEntry {
    id: u64,
    created_at: Instant,
    future: SharedComputation,
    cancel: CancellationToken,
}

/// Outcome of [`InFlightTable::join_or_register`].
pub enum Registration {
    /// Another caller already runs the computation.
    Joined(SharedComputation),
    /// This caller registered the computation and should drive it.
    Leader(SharedComputation),
}

/// Removes its entry from the table when dropped.
pub struct InFlightGuard {
    table: Weak<InFlightTable>,
    key: String,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.remove_exact(&self.key, self.id);
        }
    }
}

pub struct InFlightTable {
    entries: DashMap<String, InFlightEntry>,
    live: AtomicUsize,
    next_id: AtomicU64,
    capacity: usize,
    grace: Duration,
}

impl std::fmt::Debug for InFlightTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightTable")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("grace", &self.grace)
            .finish()
    }
}

impl InFlightTable {
    pub fn new(capacity: usize, grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            live: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            capacity,
            grace,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_fresh(&self, entry: &InFlightEntry) -> bool {
        entry.created_at.elapsed() <= self.grace
    }

    /// Join the running computation for `key`, or register a new one built by `make`.
    ///
    /// `make` receives the guard and cancellation token of the new entry; the
    /// returned future must own the guard.
    pub fn join_or_register<F>(
        self: &Arc<Self>,
        key: &str,
        cancel: CancellationToken,
        make: F,
    ) -> Result<Registration>
    where
        F: FnOnce(InFlightGuard, CancellationToken) -> SharedComputation,
    {
        if let Some(existing) = self.entries.get(key)
            && self.is_fresh(&existing)
        {
            metrics::record_coalesced();
            return Ok(Registration::Joined(existing.future.clone()));
        }

        self.reserve_slot()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let build = |table: &Arc<Self>| {
            let guard = InFlightGuard {
                table: Arc::downgrade(table),
                key: key.to_string(),
                id,
            };
            let future = make(guard, cancel.clone());
            InFlightEntry {
                id,
                created_at: Instant::now(),
                future,
                cancel,
            }
        };

        // The replaced stale entry is dropped only after the shard lock is released.
        let (registration, _replaced) = match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) if self.is_fresh(occupied.get()) => {
                self.release_slot();
                metrics::record_coalesced();
                (Registration::Joined(occupied.get().future.clone()), None)
            }
            Entry::Occupied(mut occupied) => {
                self.release_slot();
                let entry = build(self);
                let future = entry.future.clone();
                let stale = occupied.insert(entry);
                tracing::debug!(key = %key, "replaced stale in-flight computation");
                (Registration::Leader(future), Some(stale))
            }
            Entry::Vacant(vacant) => {
                let entry = build(self);
                let future = entry.future.clone();
                vacant.insert(entry);
                (Registration::Leader(future), None)
            }
        };
        metrics::set_inflight_entries(self.len());
        Ok(registration)
    }

    fn reserve_slot(&self) -> Result<()> {
        let mut current = self.live.load(Ordering::SeqCst);
        while current < self.capacity {
            match self.live.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }

        // Full: the slot of a reclaimed stale entry passes to the caller.
        if self.reclaim_one_stale() {
            return Ok(());
        }

        metrics::record_capacity_rejection();
        tracing::warn!(capacity = self.capacity, "in-flight table full, rejecting computation");
        Err(CacheError::CapacityExceeded {
            capacity: self.capacity,
        })
    }

    fn release_slot(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    fn reclaim_one_stale(&self) -> bool {
        let candidates: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter(|e| !self.is_fresh(e.value()))
            .map(|e| (e.key().clone(), e.value().id))
            .collect();

        for (key, id) in candidates {
            if let Some((_, stale)) = self.entries.remove_if(&key, |_, e| e.id == id) {
                tracing::debug!(key = %key, "reclaimed stale in-flight slot");
                metrics::record_inflight_swept(1);
                drop(stale);
                return true;
            }
        }
        false
    }

    fn remove_exact(&self, key: &str, id: u64) {
        if let Some((_, entry)) = self.entries.remove_if(key, |_, e| e.id == id) {
            self.release_slot();
            drop(entry);
            metrics::set_inflight_entries(self.len());
        }
    }

    /// Remove every entry older than the grace period. Returns how many were removed.
    pub fn sweep_stale(&self) -> usize {
        let stale: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter(|e| !self.is_fresh(e.value()))
            .map(|e| (e.key().clone(), e.value().id))
            .collect();

        let mut removed = 0;
        for (key, id) in stale {
            if let Some((_, entry)) = self.entries.remove_if(&key, |_, e| e.id == id) {
                self.release_slot();
                removed += 1;
                drop(entry);
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "swept stale in-flight computations");
            metrics::record_inflight_swept(removed);
        }
        metrics::set_inflight_entries(self.len());
        removed
    }

    /// Cancel the computation running for `key`, if any.
    pub fn cancel(&self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running computation.
    pub fn cancel_all(&self) {
        for entry in self.entries.iter() {
            entry.cancel.cancel();
        }
    }
}

/// Spawn the periodic stale sweep. The task ends once the table is dropped.
pub fn spawn_sweeper(table: &Arc<InFlightTable>, every: Duration) -> tokio::task::JoinHandle<()> {
    let weak = Arc::downgrade(table);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            match weak.upgrade() {
                Some(table) => {
                    table.sweep_stale();
                }
                None => break,
            }
        }
    })
}
