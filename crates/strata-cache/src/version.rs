//! Dependency version groups.
//!
//! A group is keyed by the sorted, `:`-joined names of the dependencies a query
//! declared (`"orders:users"`). Its counter is embedded in physical cache keys,
//! so bumping it makes every entry written under the previous version
//! unreachable without enumerating keys.
//!
//! Versions are drawn from one map-wide generation counter rather than counted
//! per group. A group that is evicted and later recreated therefore starts above
//! any version it held before, and entries written under the old version stay
//! unreachable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;

use crate::metrics;

/// Group key used when a query declares no dependencies.
pub const UNSCOPED_GROUP: &str = "_";

#[derive(Debug, Clone)]
struct VersionEntry {
    version: u64,
    last_accessed: Instant,
    dependency_count: usize,
}

/// Snapshot of one group, for stats and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionGroup {
    pub group: String,
    pub version: u64,
    pub dependency_count: usize,
}

/// Build the canonical group key for a dependency list.
///
/// Names are trimmed, de-duplicated and sorted, so declaration order never matters.
pub fn group_key<S: AsRef<str>>(depends_on: &[S]) -> String {
    let mut names: Vec<&str> = depends_on
        .iter()
        .map(|d| d.as_ref().trim())
        .filter(|d| !d.is_empty())
        .collect();
    if names.is_empty() {
        return UNSCOPED_GROUP.to_string();
    }
    names.sort_unstable();
    names.dedup();
    names.join(":")
}

#[derive(Debug)]
pub struct VersionMap {
    groups: DashMap<String, VersionEntry>,
    generation: AtomicU64,
    max_groups: usize,
    max_version: u64,
}

impl VersionMap {
    pub fn new(max_groups: usize, max_version: u64) -> Self {
        Self {
            groups: DashMap::new(),
            generation: AtomicU64::new(0),
            max_groups: max_groups.max(1),
            max_version: max_version.max(2),
        }
    }

    /// Take the next generation, wrapping to 1 before `max_version`.
    fn next_generation(&self) -> u64 {
        let max_version = self.max_version;
        let previous = self
            .generation
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(next_version(current, max_version))
            })
            .unwrap_or_default();
        next_version(previous, max_version)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Current version of a group, creating it at the next generation on first
    /// use. The first group of a fresh map starts at 1.
    pub fn current(&self, group: &str) -> u64 {
        if let Some(mut entry) = self.groups.get_mut(group) {
            entry.last_accessed = Instant::now();
            return entry.version;
        }

        if self.groups.len() >= self.max_groups {
            self.evict_oldest();
        }

        let mut entry = self
            .groups
            .entry(group.to_string())
            .or_insert_with(|| VersionEntry {
                version: self.next_generation(),
                last_accessed: Instant::now(),
                dependency_count: dependency_count(group),
            });
        entry.last_accessed = Instant::now();
        entry.version
    }

    /// Bump every group whose dependency set contains `name`.
    ///
    /// When no group mentions `name` yet, a group for it is seeded at a fresh
    /// generation (never below 2) so that entries cached under any earlier
    /// version of it are already stale. Returns the number of groups bumped or seeded.
    pub fn bump(&self, name: &str) -> usize {
        let name = name.trim();
        let mut bumped = 0;
        for mut entry in self.groups.iter_mut() {
            if entry.key().split(':').any(|dep| dep == name) {
                entry.version = self.next_generation();
                entry.last_accessed = Instant::now();
                bumped += 1;
            }
        }
        if bumped > 0 {
            return bumped;
        }

        if self.groups.len() >= self.max_groups {
            self.evict_oldest();
        }
        let mut version = self.next_generation();
        if version == 1 {
            version = self.next_generation();
        }
        match self.groups.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.version = version;
                entry.last_accessed = Instant::now();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(VersionEntry {
                    version,
                    last_accessed: Instant::now(),
                    dependency_count: 1,
                });
            }
        }
        1
    }

    /// Drop the least recently accessed 10% of groups (at least one).
    pub fn evict_oldest(&self) -> usize {
        let mut by_age: Vec<(String, Instant)> = self
            .groups
            .iter()
            .map(|e| (e.key().clone(), e.value().last_accessed))
            .collect();
        if by_age.is_empty() {
            return 0;
        }
        by_age.sort_unstable_by_key(|(_, accessed)| *accessed);

        let count = (by_age.len() / 10).max(1);
        let mut evicted = 0;
        for (group, _) in by_age.into_iter().take(count) {
            if self.groups.remove(&group).is_some() {
                evicted += 1;
            }
        }
        tracing::debug!(evicted, "evicted least recently used version groups");
        metrics::record_version_evictions(evicted);
        evicted
    }

    /// Drop groups untouched for longer than `idle`.
    pub fn sweep_idle(&self, idle: Duration) -> usize {
        let before = self.groups.len();
        self.groups
            .retain(|_, entry| entry.last_accessed.elapsed() <= idle);
        let removed = before.saturating_sub(self.groups.len());
        if removed > 0 {
            tracing::debug!(removed, "swept idle version groups");
            metrics::record_version_evictions(removed);
        }
        removed
    }

    /// Every known group with its current version.
    pub fn snapshot(&self) -> Vec<VersionGroup> {
        let mut groups: Vec<VersionGroup> = self
            .groups
            .iter()
            .map(|e| VersionGroup {
                group: e.key().clone(),
                version: e.value().version,
                dependency_count: e.value().dependency_count,
            })
            .collect();
        groups.sort_by(|a, b| a.group.cmp(&b.group));
        groups
    }

    /// Drop every group. The generation keeps counting, so versions handed out
    /// before the clear are not reused.
    pub fn clear(&self) {
        self.groups.clear();
    }
}

fn dependency_count(group: &str) -> usize {
    if group == UNSCOPED_GROUP {
        0
    } else {
        group.split(':').count()
    }
}

fn next_version(current: u64, max_version: u64) -> u64 {
    if current >= max_version - 1 { 1 } else { current + 1 }
}
