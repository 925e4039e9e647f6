//! Prometheus metrics for the cache engine.
//!
//! This module provides:
//! - Tier metrics (hits per tier, misses, local entries)
//! - Degraded-mode counters (shared-tier errors, corrupted entries)
//! - Stampede protection counters (coalesced joins, capacity rejections, timeouts)
//! - Invalidation counters (keys invalidated, dropped events, version evictions)

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // Tier metrics
    pub const CACHE_HITS_TOTAL: &str = "strata_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "strata_cache_misses_total";
    pub const CACHE_LOCAL_ENTRIES: &str = "strata_cache_local_entries";

    // Degraded mode
    pub const SHARED_ERRORS_TOTAL: &str = "strata_shared_tier_errors_total";
    pub const CORRUPTED_ENTRIES_TOTAL: &str = "strata_corrupted_entries_total";

    // Stampede protection
    pub const INFLIGHT_COALESCED_TOTAL: &str = "strata_inflight_coalesced_total";
    pub const INFLIGHT_REJECTED_TOTAL: &str = "strata_inflight_rejected_total";
    pub const INFLIGHT_TIMEOUTS_TOTAL: &str = "strata_inflight_timeouts_total";
    pub const INFLIGHT_SWEPT_TOTAL: &str = "strata_inflight_swept_total";
    pub const INFLIGHT_ENTRIES: &str = "strata_inflight_entries";

    // Invalidation
    pub const VERSION_EVICTIONS_TOTAL: &str = "strata_version_group_evictions_total";
    pub const KEYS_INVALIDATED_TOTAL: &str = "strata_keys_invalidated_total";
    pub const EVENTS_DROPPED_TOTAL: &str = "strata_invalidation_events_dropped_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// This should be called once at process startup.
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

// =============================================================================
// Tier Metrics
// =============================================================================

/// Record a cache hit.
pub fn record_cache_hit(tier: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

pub fn set_local_entries(count: u64) {
    gauge!(names::CACHE_LOCAL_ENTRIES).set(count as f64);
}

// =============================================================================
// Degraded Mode
// =============================================================================

pub fn record_shared_error(operation: &'static str) {
    counter!(names::SHARED_ERRORS_TOTAL, "operation" => operation).increment(1);
}

pub fn record_corrupted_entry() {
    counter!(names::CORRUPTED_ENTRIES_TOTAL).increment(1);
}

// =============================================================================
// Stampede Protection
// =============================================================================

pub fn record_coalesced() {
    counter!(names::INFLIGHT_COALESCED_TOTAL).increment(1);
}

pub fn record_capacity_rejection() {
    counter!(names::INFLIGHT_REJECTED_TOTAL).increment(1);
}

pub fn record_compute_timeout() {
    counter!(names::INFLIGHT_TIMEOUTS_TOTAL).increment(1);
}

pub fn record_inflight_swept(count: usize) {
    counter!(names::INFLIGHT_SWEPT_TOTAL).increment(count as u64);
}

pub fn set_inflight_entries(count: usize) {
    gauge!(names::INFLIGHT_ENTRIES).set(count as f64);
}

// =============================================================================
// Invalidation
// =============================================================================

pub fn record_version_evictions(count: usize) {
    counter!(names::VERSION_EVICTIONS_TOTAL).increment(count as u64);
}

pub fn record_keys_invalidated(source: &'static str, count: usize) {
    counter!(names::KEYS_INVALIDATED_TOTAL, "source" => source).increment(count as u64);
}

pub fn record_event_dropped(policy: &'static str) {
    counter!(names::EVENTS_DROPPED_TOTAL, "policy" => policy).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_without_exporter_are_noops() {
        // No recorder installed in this test: the macros must not panic.
        record_cache_hit("local");
        record_cache_miss();
        record_event_dropped("drop_oldest");
    }

    #[test]
    fn test_init_and_render() {
        let _ = init_metrics();
        record_cache_hit("shared");
        let rendered = render_metrics().expect("metrics initialized");
        assert!(rendered.contains(names::CACHE_HITS_TOTAL));
        // Second initialization is refused.
        assert!(!init_metrics());
    }
}
