// tests/integration/interceptor_test.rs

//! Integration tests for the cache interceptor: hits, misses, bypasses,
//! invalidation, vary negotiation, request directives and aborts.

use super::test_helpers::{
    RecordingHandler, Reply, T0, TestContext, body_of, key, request,
};
use async_trait::async_trait;
use http::Method;
use spinelcache::core::clock::ManualClock;
use spinelcache::core::errors::{CacheError, DispatchError};
use spinelcache::core::headers::Headers;
use spinelcache::core::interceptor::CacheOptions;
use spinelcache::core::policy::CacheType;
use spinelcache::core::storage::{CacheStore, CacheWriter, CachedResponse, CachedValue};
use spinelcache::core::{CacheKey, Dispatcher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

// ===== Freshness =====

#[tokio::test]
async fn test_fresh_hit_reports_age_then_misses_after_expiry() {
    let ctx = TestContext::new();
    ctx.origin.push(Reply::ok("public, max-age=60", "hello"));

    let first = ctx.get("/a").await;
    assert_eq!(first.status(), 200);
    assert_eq!(body_of(&first), "hello");
    assert_eq!(first.header("age"), None);
    assert_eq!(ctx.origin.request_count(), 1);

    let (stored, _) = ctx.stored("/a").await.expect("response should be cached");
    assert_eq!(stored.cached_at, T0);
    assert_eq!(stored.stale_at, T0 + 60_000);
    assert_eq!(stored.delete_at, T0 + 60_000);

    ctx.at(30_000);
    let hit = ctx.get("/a").await;
    assert_eq!(body_of(&hit), "hello");
    assert_eq!(hit.header("age").as_deref(), Some("30"));
    assert_eq!(hit.header("warning"), None);
    assert_eq!(ctx.origin.request_count(), 1, "fresh hit must not reach the origin");

    ctx.at(70_000);
    let miss = ctx.get("/a").await;
    assert_eq!(body_of(&miss), "hello");
    assert_eq!(miss.header("age"), None);
    assert_eq!(ctx.origin.request_count(), 2);

    let stats = ctx.interceptor.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.stores, 2);
}

#[tokio::test]
async fn test_multi_chunk_body_is_replayed() {
    let ctx = TestContext::new();
    ctx.origin
        .push(Reply::ok("max-age=60", "").chunks(&["one ", "two ", "three"]));

    let first = ctx.get("/chunks").await;
    assert_eq!(first.chunks, 3);
    assert_eq!(body_of(&first), "one two three");

    let hit = ctx.get("/chunks").await;
    assert_eq!(body_of(&hit), "one two three");
    assert_eq!(ctx.origin.request_count(), 1);
}

#[tokio::test]
async fn test_head_request_gets_no_body_from_cache() {
    let ctx = TestContext::new();
    ctx.origin.push(Reply::ok("max-age=60", "head body"));

    ctx.send(request(Method::HEAD, "/h")).await;
    let hit = ctx.send(request(Method::HEAD, "/h")).await;
    assert_eq!(hit.status(), 200);
    assert!(hit.body.is_empty());
    assert_eq!(hit.header("age").as_deref(), Some("0"));
    assert_eq!(ctx.origin.request_count(), 1);

    // HEAD and GET are cached separately.
    ctx.get("/h").await;
    assert_eq!(ctx.origin.request_count(), 2);
}

#[tokio::test]
async fn test_uncacheable_responses_are_not_stored() {
    let ctx = TestContext::new();
    let replies = [
        Reply::ok("no-store", "a"),
        Reply::ok("private, max-age=60", "b"),
        Reply::ok("max-age=60", "c").header("vary", "*"),
        Reply::status(404, "d").header("cache-control", "max-age=60"),
        // No freshness information at all.
        Reply::ok("", "e"),
    ];

    for (i, reply) in replies.into_iter().enumerate() {
        let path = format!("/uncacheable/{i}");
        ctx.origin.push(reply);
        ctx.get(&path).await;
        ctx.get(&path).await;
    }
    assert_eq!(ctx.origin.request_count(), 10);
    assert_eq!(ctx.store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_private_cache_stores_private_and_ignores_s_maxage() {
    let ctx = TestContext::with_options(|o| o.cache_type(CacheType::Private));
    ctx.origin
        .push(Reply::ok("private, max-age=10, s-maxage=100", "mine"));

    ctx.get("/p").await;
    let (stored, _) = ctx.stored("/p").await.expect("private cache stores private");
    assert_eq!(stored.stale_at, T0 + 10_000);
}

#[tokio::test]
async fn test_shared_cache_prefers_s_maxage() {
    let ctx = TestContext::new();
    ctx.origin.push(Reply::ok("max-age=10, s-maxage=100", "shared"));

    ctx.get("/s").await;
    let (stored, _) = ctx.stored("/s").await.unwrap();
    assert_eq!(stored.stale_at, T0 + 100_000);
}

#[tokio::test]
async fn test_authorized_request_needs_public() {
    let ctx = TestContext::new();
    ctx.origin.push(Reply::ok("max-age=60", "secret"));

    ctx.send(request(Method::GET, "/auth").with_header("authorization", "Bearer x"))
        .await;
    assert_eq!(ctx.store.len().await.unwrap(), 0);

    ctx.origin.push(Reply::ok("public, max-age=60", "shared"));
    ctx.send(request(Method::GET, "/auth2").with_header("authorization", "Bearer x"))
        .await;
    assert_eq!(ctx.store.len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_scoped_no_cache_strips_named_headers() {
    let ctx = TestContext::new();
    ctx.origin.push(
        Reply::ok("max-age=60, no-cache=\"set-cookie\"", "body")
            .header("set-cookie", "session=1")
            .header("connection", "x-hop")
            .header("x-hop", "1")
            .header("x-kept", "yes"),
    );

    let first = ctx.get("/strip").await;
    assert_eq!(first.header("set-cookie").as_deref(), Some("session=1"));

    let hit = ctx.get("/strip").await;
    assert_eq!(hit.header("set-cookie"), None);
    assert_eq!(hit.header("connection"), None);
    assert_eq!(hit.header("x-hop"), None);
    assert_eq!(hit.header("x-kept").as_deref(), Some("yes"));
    assert_eq!(ctx.origin.request_count(), 1);
}

// ===== Bypass =====

#[tokio::test]
async fn test_request_no_store_bypasses_cache() {
    let ctx = TestContext::new();
    ctx.origin.push(Reply::ok("max-age=60", "fresh"));

    ctx.send(request(Method::GET, "/ns").with_header("cache-control", "no-store"))
        .await;
    assert_eq!(ctx.store.len().await.unwrap(), 0);

    ctx.get("/ns").await;
    ctx.send(request(Method::GET, "/ns").with_header("cache-control", "no-store"))
        .await;
    assert_eq!(ctx.origin.request_count(), 3);
    assert_eq!(ctx.interceptor.stats().bypasses, 2);
}

#[tokio::test]
async fn test_request_without_origin_bypasses_cache() {
    let ctx = TestContext::new();
    ctx.origin.push(Reply::ok("max-age=60", "x"));

    let mut req = request(Method::GET, "/no-origin");
    req.origin = None;
    ctx.send(req.clone()).await;
    ctx.send(req).await;

    assert_eq!(ctx.origin.request_count(), 2);
    assert_eq!(ctx.store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_method_outside_configured_set_bypasses() {
    let ctx = TestContext::with_options(|o| o.methods(vec![Method::GET]));
    ctx.origin.push(Reply::ok("max-age=60", "x"));

    ctx.send(request(Method::HEAD, "/m")).await;
    ctx.send(request(Method::HEAD, "/m")).await;
    assert_eq!(ctx.origin.request_count(), 2);
    assert_eq!(ctx.interceptor.stats().bypasses, 2);
}

#[test]
fn test_unsafe_methods_are_rejected_in_options() {
    let ctx = TestContext::new();
    let options = CacheOptions::new(ctx.store.clone())
        .methods(vec![Method::GET, Method::POST]);
    assert!(options.validate().is_err());

    let options = CacheOptions::new(ctx.store.clone()).methods(vec![]);
    assert!(options.validate().is_err());
}

// ===== Invalidation =====

#[tokio::test]
async fn test_successful_post_invalidates_resource() {
    let ctx = TestContext::new();
    ctx.origin.push(Reply::ok("max-age=60", "v1"));
    ctx.get("/r").await;
    ctx.get("/r").await;
    assert_eq!(ctx.origin.request_count(), 1);

    ctx.origin.push(Reply::status(201, "created"));
    ctx.send(request(Method::POST, "/r").with_body("payload")).await;
    assert!(ctx.stored("/r").await.is_none());

    ctx.origin.push(Reply::ok("max-age=60", "v2"));
    let after = ctx.get("/r").await;
    assert_eq!(body_of(&after), "v2");
    assert_eq!(ctx.origin.request_count(), 3);
    assert_eq!(ctx.interceptor.stats().invalidations, 1);
}

#[tokio::test]
async fn test_no_store_post_still_invalidates_resource() {
    let ctx = TestContext::new();
    ctx.origin.push(Reply::ok("max-age=60", "v1"));
    ctx.get("/r").await;
    assert!(ctx.stored("/r").await.is_some());

    ctx.origin.push(Reply::status(201, "created"));
    ctx.send(
        request(Method::POST, "/r")
            .with_header("cache-control", "no-store")
            .with_body("payload"),
    )
    .await;
    assert!(ctx.stored("/r").await.is_none());
    assert_eq!(ctx.interceptor.stats().invalidations, 1);
    assert_eq!(ctx.interceptor.stats().bypasses, 0);
}

#[tokio::test]
async fn test_failed_post_keeps_cached_resource() {
    let ctx = TestContext::new();
    ctx.origin.push(Reply::ok("max-age=60", "v1"));
    ctx.get("/r").await;

    ctx.origin.push(Reply::status(500, "boom"));
    ctx.send(request(Method::DELETE, "/r")).await;

    ctx.origin.push(Reply::ok("max-age=60", "v2"));
    let hit = ctx.get("/r").await;
    assert_eq!(body_of(&hit), "v1");
    assert_eq!(ctx.interceptor.stats().invalidations, 0);
}

// ===== Vary =====

#[tokio::test]
async fn test_vary_accept_encoding_selects_variants() {
    let ctx = TestContext::new();
    ctx.origin
        .push(Reply::ok("max-age=60", "plain").header("vary", "Accept-Encoding"));

    assert_eq!(body_of(&ctx.get("/v").await), "plain");
    assert_eq!(body_of(&ctx.get("/v").await), "plain");
    assert_eq!(ctx.origin.request_count(), 1);

    ctx.origin
        .push(Reply::ok("max-age=60", "gzipped").header("vary", "Accept-Encoding"));
    let gzip = || request(Method::GET, "/v").with_header("accept-encoding", "gzip");
    assert_eq!(body_of(&ctx.send(gzip()).await), "gzipped");
    assert_eq!(ctx.origin.request_count(), 2);

    assert_eq!(body_of(&ctx.send(gzip()).await), "gzipped");
    assert_eq!(body_of(&ctx.get("/v").await), "plain");
    assert_eq!(ctx.origin.request_count(), 2);
    assert_eq!(ctx.store.len().await.unwrap(), 2);
}

#[tokio::test]
async fn test_vary_ignores_request_header_order() {
    let ctx = TestContext::new();
    ctx.origin.push(
        Reply::ok("max-age=60", "negotiated").header("vary", "accept-encoding, accept-language"),
    );

    ctx.send(
        request(Method::GET, "/o")
            .with_header("accept-encoding", "br")
            .with_header("accept-language", "en"),
    )
    .await;
    let hit = ctx
        .send(
            request(Method::GET, "/o")
                .with_header("accept-language", "en")
                .with_header("accept-encoding", "br"),
        )
        .await;
    assert_eq!(body_of(&hit), "negotiated");
    assert!(hit.header("age").is_some());
    assert_eq!(ctx.origin.request_count(), 1);
}

// ===== Request directives =====

#[tokio::test]
async fn test_only_if_cached_miss_is_gateway_timeout() {
    let ctx = TestContext::new();

    let response = ctx
        .send(request(Method::GET, "/oic").with_header("cache-control", "only-if-cached"))
        .await;
    assert_eq!(response.status(), 504);
    assert!(response.body.is_empty());
    assert_eq!(ctx.origin.request_count(), 0);
}

#[tokio::test]
async fn test_only_if_cached_serves_stale_without_origin() {
    let ctx = TestContext::new();
    ctx.origin
        .push(Reply::ok("max-age=10, stale-if-error=100", "old"));
    ctx.get("/oic").await;

    ctx.at(20_000);
    let response = ctx
        .send(request(Method::GET, "/oic").with_header("cache-control", "only-if-cached"))
        .await;
    assert_eq!(body_of(&response), "old");
    assert!(response.header("warning").is_some());
    assert_eq!(ctx.origin.request_count(), 1);
}

#[tokio::test]
async fn test_request_max_stale_accepts_stale_entry() {
    let ctx = TestContext::new();
    ctx.origin
        .push(Reply::ok("max-age=10, stale-if-error=100", "old"));
    ctx.get("/ms").await;

    ctx.at(20_000);
    let response = ctx
        .send(request(Method::GET, "/ms").with_header("cache-control", "max-stale=30"))
        .await;
    assert_eq!(body_of(&response), "old");
    assert_eq!(response.header("age").as_deref(), Some("20"));
    assert!(response.header("warning").is_some());
    assert_eq!(ctx.origin.request_count(), 1);

    // Past the accepted staleness the entry is revalidated.
    ctx.at(50_000);
    ctx.origin.push(Reply::ok("max-age=10", "new"));
    let response = ctx
        .send(request(Method::GET, "/ms").with_header("cache-control", "max-stale=30"))
        .await;
    assert_eq!(body_of(&response), "new");
    assert_eq!(ctx.origin.request_count(), 2);
}

#[tokio::test]
async fn test_must_revalidate_overrides_max_stale() {
    let ctx = TestContext::new();
    ctx.origin
        .push(Reply::ok("max-age=10, stale-if-error=100, must-revalidate", "old"));
    ctx.get("/mr").await;

    ctx.at(20_000);
    ctx.origin.push(Reply::ok("max-age=10", "new"));
    let response = ctx
        .send(request(Method::GET, "/mr").with_header("cache-control", "max-stale"))
        .await;
    assert_eq!(body_of(&response), "new");
    assert_eq!(ctx.origin.request_count(), 2);
}

#[tokio::test]
async fn test_min_fresh_forces_revalidation() {
    let ctx = TestContext::new();
    ctx.origin.push(Reply::ok("max-age=60", "v1"));
    ctx.get("/mf").await;

    ctx.at(50_000);
    let plain = ctx.get("/mf").await;
    assert_eq!(body_of(&plain), "v1");
    assert_eq!(ctx.origin.request_count(), 1);

    ctx.origin.push(Reply::ok("max-age=60", "v2"));
    let response = ctx
        .send(request(Method::GET, "/mf").with_header("cache-control", "min-fresh=20"))
        .await;
    assert_eq!(body_of(&response), "v2");
    assert_eq!(ctx.origin.request_count(), 2);
}

#[tokio::test]
async fn test_request_max_age_forces_revalidation() {
    let ctx = TestContext::new();
    ctx.origin.push(Reply::ok("max-age=600", "v1"));
    ctx.get("/ma").await;

    ctx.at(30_000);
    ctx.origin.push(Reply::ok("max-age=600", "v2"));
    let response = ctx
        .send(request(Method::GET, "/ma").with_header("cache-control", "max-age=10"))
        .await;
    assert_eq!(body_of(&response), "v2");
    assert_eq!(ctx.origin.request_count(), 2);
}

// ===== Aborts =====

#[tokio::test]
async fn test_cancelled_signal_aborts_cached_serve_and_releases_slot() {
    let ctx = TestContext::new();
    ctx.origin.push(Reply::ok("max-age=60", "cached"));
    ctx.get("/abort").await;

    let signal = CancellationToken::new();
    signal.cancel();
    let err = ctx
        .try_send(request(Method::GET, "/abort").with_signal(signal))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Aborted(_)));

    // No read guard was leaked: the slot is writable again.
    let (stored, _) = ctx.stored("/abort").await.unwrap();
    let writer = ctx
        .store
        .create_write_stream(&key(Method::GET, "/abort", Headers::new()), stored)
        .await
        .unwrap();
    assert!(writer.is_some());
}

#[tokio::test]
async fn test_abort_mid_body_discards_partial_entry() {
    let ctx = TestContext::new();
    ctx.origin
        .push(Reply::ok("max-age=60", "").chunks(&["a", "b", "c"]));

    let (handler, recorded) = RecordingHandler::new(Some(1));
    let completed = ctx
        .interceptor
        .dispatch(request(Method::GET, "/partial"), Box::new(handler))
        .await;
    assert!(!completed);
    {
        let recorded = recorded.lock();
        assert_eq!(recorded.chunks.len(), 1);
        assert!(!recorded.ended);
        assert!(matches!(recorded.error, Some(DispatchError::Aborted(_))));
    }
    assert_eq!(ctx.store.len().await.unwrap(), 0);

    let retry = ctx.get("/partial").await;
    assert_eq!(body_of(&retry), "abc");
    assert_eq!(ctx.origin.request_count(), 2);
}

// ===== Store failures =====

/// A store whose every operation fails.
#[derive(Debug)]
struct BrokenStore;

#[async_trait]
impl CacheStore for BrokenStore {
    async fn get(&self, _key: &CacheKey) -> Result<Option<CachedResponse>, CacheError> {
        Err(CacheError::Internal("disk on fire".into()))
    }

    async fn create_write_stream(
        &self,
        _key: &CacheKey,
        _value: CachedValue,
    ) -> Result<Option<Box<dyn CacheWriter>>, CacheError> {
        Err(CacheError::Internal("disk on fire".into()))
    }

    async fn delete(&self, _key: &CacheKey) -> Result<(), CacheError> {
        Err(CacheError::Internal("disk on fire".into()))
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        Ok(0)
    }

    async fn len(&self) -> Result<usize, CacheError> {
        Ok(0)
    }
}

#[tokio::test]
async fn test_store_failures_are_reported_not_surfaced() {
    let reported = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reported);
    let ctx = TestContext::with_store(ManualClock::new(T0), Arc::new(BrokenStore), move |o| {
        o.on_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    });
    ctx.origin.push(Reply::ok("max-age=60", "still works"));

    let response = ctx.get("/broken").await;
    assert_eq!(response.status(), 200);
    assert_eq!(body_of(&response), "still works");

    ctx.origin.push(Reply::status(204, ""));
    let response = ctx.send(request(Method::PUT, "/broken")).await;
    assert_eq!(response.status(), 204);

    // Lookup, write stream and invalidation each failed once.
    assert_eq!(reported.load(Ordering::SeqCst), 3);
    assert_eq!(ctx.interceptor.stats().store_errors, 3);
}
