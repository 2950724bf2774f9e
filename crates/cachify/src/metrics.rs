//! Prometheus metrics for the caching stack.
//!
//! This module provides:
//! - Cache read/write metrics (hits by layer, misses, sets, removes)
//! - Resiliency metrics (stale serves, soft/hard factory timeouts)
//! - Backplane metrics (published/received/dropped messages)

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // Cache metrics
    pub const CACHE_HIT_TOTAL: &str = "cache_hit_total";
    pub const CACHE_MISS_TOTAL: &str = "cache_miss_total";
    pub const CACHE_SET_TOTAL: &str = "cache_set_total";
    pub const CACHE_REMOVE_TOTAL: &str = "cache_remove_total";
    pub const CACHE_GET_DURATION_MS: &str = "cache_get_duration_ms";

    // Resiliency metrics
    pub const STALE_SERVED_COUNT: &str = "stale_served_count";
    pub const FACTORY_TIMEOUT_SOFT_COUNT: &str = "factory_timeout_soft_count";
    pub const FACTORY_TIMEOUT_HARD_COUNT: &str = "factory_timeout_hard_count";
    pub const FAILSAFE_USED_COUNT: &str = "failsafe_used_count";

    // Backplane metrics
    pub const BACKPLANE_PUBLISHED_TOTAL: &str = "backplane_messages_published_total";
    pub const BACKPLANE_RECEIVED_TOTAL: &str = "backplane_messages_received_total";
    pub const BACKPLANE_DROPPED_TOTAL: &str = "backplane_messages_dropped_total";
    pub const BACKPLANE_TAG_EVENTS_TOTAL: &str = "backplane_tag_events_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Call once at startup. Returns `true` if initialization succeeded,
/// `false` if already initialized.
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
// Cache Metrics
// =============================================================================

/// Record a cache hit on the given layer (`L1`, `L2`, or `stale`).
pub fn record_cache_hit(layer: &'static str) {
    counter!(names::CACHE_HIT_TOTAL, "layer" => layer).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss() {
    counter!(names::CACHE_MISS_TOTAL).increment(1);
}

/// Record a cache write.
pub fn record_cache_set() {
    counter!(names::CACHE_SET_TOTAL).increment(1);
}

/// Record a cache removal.
pub fn record_cache_remove() {
    counter!(names::CACHE_REMOVE_TOTAL).increment(1);
}

/// Record the duration of a read.
pub fn record_get_duration(duration: Duration) {
    histogram!(names::CACHE_GET_DURATION_MS).record(duration.as_secs_f64() * 1000.0);
}

// =============================================================================
// Resiliency Metrics
// =============================================================================

/// Record a stale value served to a caller, labelled by reason.
pub fn record_stale_served(reason: &'static str) {
    counter!(names::STALE_SERVED_COUNT, "reason" => reason).increment(1);
}

/// Record a soft factory timeout.
pub fn record_soft_timeout() {
    counter!(names::FACTORY_TIMEOUT_SOFT_COUNT).increment(1);
}

/// Record a hard factory timeout.
pub fn record_hard_timeout() {
    counter!(names::FACTORY_TIMEOUT_HARD_COUNT).increment(1);
}

/// Record a read satisfied only because of the fail-safe window.
pub fn record_failsafe_used() {
    counter!(names::FAILSAFE_USED_COUNT).increment(1);
}

// =============================================================================
// Backplane Metrics
// =============================================================================

/// Record a published backplane message.
pub fn record_backplane_published(items: usize) {
    counter!(names::BACKPLANE_PUBLISHED_TOTAL).increment(items as u64);
}

/// Record a received backplane message.
pub fn record_backplane_received() {
    counter!(names::BACKPLANE_RECEIVED_TOTAL).increment(1);
}

/// Record a dropped backplane message, labelled by why.
pub fn record_backplane_dropped(reason: &'static str) {
    counter!(names::BACKPLANE_DROPPED_TOTAL, "reason" => reason).increment(1);
}

/// Record a tag invalidation received on the wire.
pub fn record_backplane_tag_event() {
    counter!(names::BACKPLANE_TAG_EVENTS_TOTAL).increment(1);
}
