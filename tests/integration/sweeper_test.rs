// tests/integration/sweeper_test.rs

//! Tests for the background expiry sweeper.

use super::test_helpers::{T0, key, value};
use http::Method;
use spinelcache::core::clock::ManualClock;
use spinelcache::core::headers::Headers;
use spinelcache::core::metrics::{CACHE_EXPIRED_TOTAL, gather_metrics};
use spinelcache::core::storage::{
    CacheStore, MemoryStore, MemoryStoreConfig, SharedStore, write_entry,
};
use spinelcache::core::tasks::ExpirySweeper;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

async fn store_with_entries(clock: &Arc<ManualClock>, lifetimes_ms: &[i64]) -> SharedStore {
    let store: SharedStore = Arc::new(
        MemoryStore::new(MemoryStoreConfig {
            clock: clock.clone(),
            ..MemoryStoreConfig::default()
        })
        .unwrap(),
    );
    for (i, lifetime) in lifetimes_ms.iter().enumerate() {
        let k = key(Method::GET, &format!("/sweep{i}"), Headers::new());
        write_entry(store.as_ref(), &k, value(T0, T0 + lifetime, T0 + lifetime), &[])
            .await
            .unwrap();
    }
    store
}

#[tokio::test]
async fn test_sweep_once_removes_expired_entries() {
    let clock = ManualClock::new(T0);
    let store = store_with_entries(&clock, &[1_000, 2_000, 60_000]).await;
    let sweeper = ExpirySweeper::new(store.clone(), Duration::from_secs(60));

    assert_eq!(sweeper.sweep_once().await, 0);

    let expired_before = CACHE_EXPIRED_TOTAL.get();
    clock.set(T0 + 5_000);
    assert_eq!(sweeper.sweep_once().await, 2);
    assert_eq!(store.len().await.unwrap(), 1);
    assert!(CACHE_EXPIRED_TOTAL.get() >= expired_before + 2.0);
    assert!(gather_metrics().contains("spinelcache_expired_total"));
}

#[tokio::test]
async fn test_run_sweeps_until_shutdown() {
    let clock = ManualClock::new(T0);
    let store = store_with_entries(&clock, &[1_000, 1_000]).await;
    clock.set(T0 + 10_000);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let sweeper = ExpirySweeper::new(store.clone(), Duration::from_millis(5));
    let handle = tokio::spawn(sweeper.run(shutdown_rx));

    tokio::time::timeout(Duration::from_secs(5), async {
        while store.len().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sweeper should purge expired entries");

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("sweeper should stop on shutdown")
        .unwrap();
}
