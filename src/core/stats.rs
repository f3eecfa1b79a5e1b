// src/core/stats.rs

//! Per-interceptor cache counters.

use crate::core::metrics;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// How a revalidation request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidationResult {
    NotModified,
    Replaced,
    Failed,
}

impl RevalidationResult {
    fn label(self) -> &'static str {
        match self {
            RevalidationResult::NotModified => "not_modified",
            RevalidationResult::Replaced => "replaced",
            RevalidationResult::Failed => "failed",
        }
    }
}

/// Counters for one interceptor. Every increment is mirrored into the global
/// Prometheus registry.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Fresh entries served from the store.
    pub hits: AtomicU64,
    /// Stale entries served (stale-while-revalidate, max-stale, stale-if-error).
    pub stale_hits: AtomicU64,
    pub misses: AtomicU64,
    /// Requests that skipped the cache entirely.
    pub bypasses: AtomicU64,
    /// Revalidation requests sent upstream.
    pub revalidations: AtomicU64,
    /// Revalidations answered with `304 Not Modified`.
    pub not_modified: AtomicU64,
    pub stores: AtomicU64,
    pub invalidations: AtomicU64,
    pub store_errors: AtomicU64,
}

/// A point-in-time copy of `CacheStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub bypasses: u64,
    pub revalidations: u64,
    pub not_modified: u64,
    pub stores: u64,
    pub invalidations: u64,
    pub store_errors: u64,
}

impl CacheStats {
    pub fn increment_hits(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_LOOKUPS_TOTAL.with_label_values(&["fresh"]).inc();
    }

    pub fn increment_stale_hits(&self) {
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_LOOKUPS_TOTAL.with_label_values(&["stale"]).inc();
    }

    pub fn increment_misses(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_LOOKUPS_TOTAL.with_label_values(&["miss"]).inc();
    }

    pub fn increment_bypasses(&self) {
        self.bypasses.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_LOOKUPS_TOTAL.with_label_values(&["bypass"]).inc();
    }

    pub fn record_revalidation(&self, result: RevalidationResult) {
        self.revalidations.fetch_add(1, Ordering::Relaxed);
        if result == RevalidationResult::NotModified {
            self.not_modified.fetch_add(1, Ordering::Relaxed);
        }
        metrics::CACHE_REVALIDATIONS_TOTAL
            .with_label_values(&[result.label()])
            .inc();
    }

    pub fn increment_stores(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_STORES_TOTAL.inc();
    }

    pub fn increment_invalidations(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_INVALIDATIONS_TOTAL.inc();
    }

    pub fn increment_store_errors(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_STORE_ERRORS_TOTAL.inc();
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bypasses: self.bypasses.load(Ordering::Relaxed),
            revalidations: self.revalidations.load(Ordering::Relaxed),
            not_modified: self.not_modified.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}
