// src/core/metrics.rs

//! Defines and registers Prometheus metrics for the cache.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, TextEncoder, register_counter, register_counter_vec};

lazy_static! {
    /// Cache lookups, labeled by outcome (`fresh`, `stale`, `miss`, `bypass`).
    pub static ref CACHE_LOOKUPS_TOTAL: CounterVec =
        register_counter_vec!("spinelcache_lookups_total", "Total number of cache lookups, labeled by outcome.", &["outcome"]).unwrap();
    /// Revalidation attempts, labeled by result (`not_modified`, `replaced`, `failed`).
    pub static ref CACHE_REVALIDATIONS_TOTAL: CounterVec =
        register_counter_vec!("spinelcache_revalidations_total", "Total number of revalidation requests, labeled by result.", &["result"]).unwrap();
    /// Responses written into a store.
    pub static ref CACHE_STORES_TOTAL: Counter =
        register_counter!("spinelcache_stores_total", "Total number of responses written to the cache.").unwrap();
    /// Resources invalidated by unsafe requests.
    pub static ref CACHE_INVALIDATIONS_TOTAL: Counter =
        register_counter!("spinelcache_invalidations_total", "Total number of resources invalidated by unsafe methods.").unwrap();
    /// Entries evicted to make room for new ones.
    pub static ref CACHE_EVICTIONS_TOTAL: Counter =
        register_counter!("spinelcache_evictions_total", "Total number of cache entries evicted.").unwrap();
    /// Entries dropped by the expiry sweeper.
    pub static ref CACHE_EXPIRED_TOTAL: Counter =
        register_counter!("spinelcache_expired_total", "Total number of expired cache entries purged.").unwrap();
    /// Store failures that were reported and swallowed.
    pub static ref CACHE_STORE_ERRORS_TOTAL: Counter =
        register_counter!("spinelcache_store_errors_total", "Total number of cache store errors.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
