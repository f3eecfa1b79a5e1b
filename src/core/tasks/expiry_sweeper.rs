// src/core/tasks/expiry_sweeper.rs

//! A background task that periodically drops expired entries from a store.
//!
//! Lookups already purge what they trip over; this task reclaims space held
//! by entries nobody asks for anymore.

use crate::core::metrics;
use crate::core::storage::SharedStore;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub struct ExpirySweeper {
    store: SharedStore,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(store: SharedStore, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// The main run loop for the sweeper.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Cache expiry sweeper started (interval: {:?}).",
            self.interval
        );
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_once().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Cache expiry sweeper shutting down.");
                    return;
                }
            }
        }
    }

    /// Runs one sweep. Returns the number of entries removed.
    pub async fn sweep_once(&self) -> usize {
        match self.store.purge_expired().await {
            Ok(0) => 0,
            Ok(removed) => {
                metrics::CACHE_EXPIRED_TOTAL.inc_by(removed as f64);
                debug!("Expiry sweeper removed {} entries.", removed);
                removed
            }
            Err(e) => {
                warn!("Cache expiry sweep failed: {}", e);
                0
            }
        }
    }
}
