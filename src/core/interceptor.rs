// src/core/interceptor.rs

//! The caching dispatcher.
//!
//! `CacheInterceptor` wraps another `Dispatcher`. For each request it either
//! bypasses the cache, serves a stored response, revalidates a stale one, or
//! forwards the request and stores the answer:
//!
//! - no origin, `no-store`, or a method outside the cacheable set: bypass
//! - unsafe method: forward, invalidate on 2xx/3xx
//! - nothing usable stored: miss, forward through a `CacheHandler`
//! - fresh entry: serve it with an `age` header
//! - stale entry inside `stale-while-revalidate`: serve it with a warning and
//!   revalidate in the background
//! - other stale entries: revalidate first, then serve or replace

use crate::core::clock::{SharedClock, system_clock};
use crate::core::directives::{CacheControlDirectives, DirectiveScope};
use crate::core::dispatch::{
    BoxedHandler, DispatchController, DispatchHandler, DispatchRequest, Dispatcher, NoopHandler,
    ResponseHead,
};
use crate::core::errors::CacheError;
use crate::core::freshness::{
    add_seconds, age_seconds, compute_delete_at, compute_stale_at, format_http_date,
};
use crate::core::handler::{CacheHandler, RevalidationHandler, RevalidationOutcome};
use crate::core::headers::Headers;
use crate::core::key::CacheKey;
use crate::core::policy::{CacheType, is_strong_etag, is_unsafe_method, strip_headers};
use crate::core::stats::{CacheStats, CacheStatsSnapshot, RevalidationResult};
use crate::core::storage::{CachedBody, CachedValue, SharedStore, write_entry};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use http::Method;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The warning attached to every stale response served from the cache.
pub const STALE_WARNING: &str = "110 - \"response is stale\"";

/// Headers of a `304` that must not overwrite the stored ones.
const NOT_MODIFIED_SKIPPED_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

pub type ErrorCallback = Arc<dyn Fn(&CacheError) + Send + Sync>;

/// Settings for a `CacheInterceptor`.
#[derive(Clone)]
pub struct CacheOptions {
    pub store: SharedStore,
    pub cache_type: CacheType,
    /// Methods whose responses are looked up and stored. Must all be safe.
    pub methods: Vec<Method>,
    /// Serve stale-while-revalidate entries immediately and refresh them in
    /// a background task. When off, such entries are revalidated inline.
    pub background_revalidation: bool,
    pub clock: SharedClock,
    /// Called for every store failure, in addition to logging it.
    pub on_error: Option<ErrorCallback>,
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("store", &self.store)
            .field("cache_type", &self.cache_type)
            .field("methods", &self.methods)
            .field("background_revalidation", &self.background_revalidation)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl CacheOptions {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            cache_type: CacheType::Shared,
            methods: vec![Method::GET, Method::HEAD],
            background_revalidation: true,
            clock: system_clock(),
            on_error: None,
        }
    }

    pub fn cache_type(mut self, cache_type: CacheType) -> Self {
        self.cache_type = cache_type;
        self
    }

    pub fn methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = methods;
        self
    }

    pub fn background_revalidation(mut self, enabled: bool) -> Self {
        self.background_revalidation = enabled;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&CacheError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.methods.is_empty() {
            return Err(CacheError::InvalidArgument(
                "at least one cacheable method is required".into(),
            ));
        }
        if let Some(method) = self.methods.iter().find(|m| is_unsafe_method(m)) {
            return Err(CacheError::InvalidArgument(format!(
                "method {method} is not safe and cannot be cached"
            )));
        }
        Ok(())
    }
}

/// State shared by the interceptor and the handlers it creates.
pub(crate) struct CacheContext {
    pub(crate) store: SharedStore,
    pub(crate) cache_type: CacheType,
    pub(crate) clock: SharedClock,
    pub(crate) stats: CacheStats,
    on_error: Option<ErrorCallback>,
}

impl CacheContext {
    pub(crate) fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Logs and counts a store failure and hands it to the error callback.
    /// The response in flight is never affected.
    pub(crate) fn report(&self, error: &CacheError, action: &str) {
        self.stats.increment_store_errors();
        warn!("Cache store error while {}: {}", action, error);
        if let Some(callback) = &self.on_error {
            callback(error);
        }
    }
}

/// How a stored entry may be used for the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Usability {
    Fresh,
    /// Stale, but the request accepts it as is (`max-stale`).
    StaleAccepted,
    /// Stale within `stale-while-revalidate`.
    StaleWhileRevalidate,
    /// Must be confirmed with the origin before use.
    Revalidate,
}

fn classify(now: i64, value: &CachedValue, request: &CacheControlDirectives) -> Usability {
    let stored = CacheControlDirectives::from_headers(&value.headers);

    let forced = request.no_cache.is_some()
        || stored.no_cache.as_ref().is_some_and(DirectiveScope::is_all)
        || request
            .max_age
            .is_some_and(|max_age| now > add_seconds(value.cached_at, max_age));
    if forced {
        return Usability::Revalidate;
    }

    let fresh_until = match request.min_fresh {
        Some(min_fresh) => value.stale_at.saturating_sub(add_seconds(0, min_fresh)),
        None => value.stale_at,
    };
    if now < fresh_until {
        return Usability::Fresh;
    }

    let revalidation_required = stored.must_revalidate || stored.proxy_revalidate;
    if let Some(max_stale) = request.max_stale {
        if !revalidation_required && now < add_seconds(value.stale_at, max_stale) {
            return Usability::StaleAccepted;
        }
    }
    if let Some(swr) = stored.stale_while_revalidate {
        if now < add_seconds(value.stale_at, swr) {
            return Usability::StaleWhileRevalidate;
        }
    }
    Usability::Revalidate
}

/// True while `stale-if-error` still allows serving the entry.
fn within_stale_if_error(now: i64, value: &CachedValue) -> bool {
    CacheControlDirectives::from_headers(&value.headers)
        .stale_if_error
        .is_some_and(|sie| now < add_seconds(value.stale_at, sie))
}

/// The request to send upstream to validate `value`.
fn conditional_request(request: &DispatchRequest, value: &CachedValue) -> DispatchRequest {
    let mut conditional = request.clone();
    conditional
        .headers
        .insert("if-modified-since", format_http_date(value.cached_at));
    if let Some(etag) = &value.etag {
        conditional.headers.insert("if-none-match", etag.clone());
    }
    conditional
}

/// Rewrites the stored entry after a `304`: headers are merged, timestamps
/// recomputed, and the body carried over untouched.
async fn refresh_entry(context: &CacheContext, key: &CacheKey, not_modified: &ResponseHead) {
    let current = match context.store.get(key).await {
        Ok(Some(current)) => current,
        Ok(None) => return,
        Err(e) => {
            context.report(&e, "reading an entry to refresh");
            return;
        }
    };
    let (old, chunks) = current.detach().into_parts();

    let mut headers = old.headers.clone();
    for (name, value) in not_modified.headers.iter() {
        if !NOT_MODIFIED_SKIPPED_HEADERS.contains(&name) {
            headers.insert(name, value.clone());
        }
    }
    let directives = CacheControlDirectives::from_headers(&headers);
    let now = context.now();
    let Some(stale_at) = compute_stale_at(now, &headers, &directives, context.cache_type) else {
        return;
    };
    let delete_at = compute_delete_at(stale_at, &directives);
    if delete_at <= now {
        return;
    }
    let etag = headers
        .first("etag")
        .filter(|etag| is_strong_etag(etag))
        .map(str::to_string)
        .or(old.etag);

    let refreshed = CachedValue {
        status_code: old.status_code,
        status_message: old.status_message,
        headers: strip_headers(&headers, &directives),
        vary: old.vary,
        etag,
        cached_at: now,
        stale_at,
        delete_at,
    };
    match write_entry(context.store.as_ref(), key, refreshed, &chunks).await {
        Ok(true) => debug!("Refreshed cached '{}' after 304", key.resource_id()),
        Ok(false) => debug!("Store refused to refresh '{}'", key.resource_id()),
        Err(e) => context.report(&e, "refreshing an entry"),
    }
}

/// Replays a stored response into `handler`.
async fn serve_cached(
    now: i64,
    signal: Option<&CancellationToken>,
    method: &Method,
    value: &CachedValue,
    mut body: CachedBody,
    mut handler: BoxedHandler,
    stale: bool,
) -> bool {
    let controller = DispatchController::new(signal);
    handler.on_request_start(&controller).await;
    if controller.is_aborted() {
        handler
            .on_response_error(&controller, controller.abort_error())
            .await;
        return false;
    }

    let mut headers = value.headers.clone();
    headers.insert("age", age_seconds(now, value.cached_at).to_string());
    if stale {
        headers.insert("warning", STALE_WARNING);
    }
    let head = ResponseHead::new(value.status_code, value.status_message.clone(), headers);
    handler.on_response_start(&controller, &head).await;

    if *method != Method::HEAD {
        loop {
            if !controller.wait_until_resumed().await {
                // Drop the body first so the slot's reader count goes down
                // before the caller hears about the abort.
                drop(body);
                handler
                    .on_response_error(&controller, controller.abort_error())
                    .await;
                return false;
            }
            match body.next().await {
                Some(chunk) => handler.on_response_data(&controller, chunk).await,
                None => break,
            }
        }
    }
    drop(body);

    if controller.is_aborted() {
        handler
            .on_response_error(&controller, controller.abort_error())
            .await;
        return false;
    }
    handler.on_response_end(&controller, &Headers::new()).await;
    true
}

/// Answers an `only-if-cached` request that the cache cannot satisfy.
async fn gateway_timeout(signal: Option<&CancellationToken>, mut handler: BoxedHandler) -> bool {
    let controller = DispatchController::new(signal);
    handler.on_request_start(&controller).await;
    let head = ResponseHead::new(504, "Gateway Timeout", Headers::new());
    handler.on_response_start(&controller, &head).await;
    handler.on_response_end(&controller, &Headers::new()).await;
    true
}

/// A `Dispatcher` that answers from a `CacheStore` whenever RFC 9111 allows.
pub struct CacheInterceptor {
    context: Arc<CacheContext>,
    next: Arc<dyn Dispatcher>,
    methods: Vec<Method>,
    background_revalidation: bool,
    revalidations: Arc<Revalidations>,
}

/// Resources with a background revalidation in flight.
#[derive(Debug, Default)]
struct Revalidations {
    slots: DashMap<String, ()>,
    finished: Notify,
}

/// Clears a revalidation's slot when its task ends, panics included.
struct RevalidationSlot {
    revalidations: Arc<Revalidations>,
    slot: String,
}

impl Drop for RevalidationSlot {
    fn drop(&mut self) {
        self.revalidations.slots.remove(&self.slot);
        self.revalidations.finished.notify_waiters();
    }
}

impl fmt::Debug for CacheInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheInterceptor")
            .field("store", &self.context.store)
            .field("cache_type", &self.context.cache_type)
            .field("methods", &self.methods)
            .field("pending_revalidations", &self.revalidations.slots.len())
            .finish()
    }
}

impl CacheInterceptor {
    pub fn new(next: Arc<dyn Dispatcher>, options: CacheOptions) -> Result<Self, CacheError> {
        options.validate()?;
        let CacheOptions {
            store,
            cache_type,
            methods,
            background_revalidation,
            clock,
            on_error,
        } = options;
        Ok(Self {
            context: Arc::new(CacheContext {
                store,
                cache_type,
                clock,
                stats: CacheStats::default(),
                on_error,
            }),
            next,
            methods,
            background_revalidation,
            revalidations: Arc::new(Revalidations::default()),
        })
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.context.stats.snapshot()
    }

    pub fn store(&self) -> &SharedStore {
        &self.context.store
    }

    /// Background revalidations still running.
    pub fn pending_revalidations(&self) -> usize {
        self.revalidations.slots.len()
    }

    /// Waits until every background revalidation has finished.
    pub async fn wait_for_revalidations(&self) {
        loop {
            let finished = self.revalidations.finished.notified();
            tokio::pin!(finished);
            // Register before checking so a task ending in between still wakes us.
            finished.as_mut().enable();
            if self.revalidations.slots.is_empty() {
                return;
            }
            finished.await;
        }
    }

    async fn bypass(&self, request: DispatchRequest, handler: BoxedHandler, reason: &str) -> bool {
        debug!("Bypassing cache ({}) for {} {}", reason, request.method, request.path);
        self.context.stats.increment_bypasses();
        self.next.dispatch(request, handler).await
    }

    /// Starts a background revalidation unless one is already running for
    /// the resource. Returns the token that cancels it.
    fn spawn_revalidation(
        &self,
        request: &DispatchRequest,
        key: &CacheKey,
        value: &CachedValue,
    ) -> Option<CancellationToken> {
        let slot = format!("{}\0{}", key.resource_id(), key.method());
        match self.revalidations.slots.entry(slot.clone()) {
            Entry::Occupied(_) => {
                debug!("Revalidation of '{}' already in flight", key.resource_id());
                return None;
            }
            Entry::Vacant(entry) => {
                entry.insert(());
            }
        }

        // Cancelling the caller's signal cancels the revalidation too.
        let token = request
            .signal
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        let mut conditional = conditional_request(request, value);
        conditional.signal = Some(token.clone());

        let context = Arc::clone(&self.context);
        let next = Arc::clone(&self.next);
        let in_flight = RevalidationSlot {
            revalidations: Arc::clone(&self.revalidations),
            slot,
        };
        let key = key.clone();
        tokio::spawn(async move {
            let _in_flight = in_flight;
            let (handler, outcome) =
                RevalidationHandler::new(CacheHandler::new(Arc::clone(&context), key.clone(), NoopHandler));
            next.dispatch(conditional, Box::new(handler)).await;
            match outcome.await {
                Ok(RevalidationOutcome::NotModified { head, .. }) => {
                    context.stats.record_revalidation(RevalidationResult::NotModified);
                    refresh_entry(&context, &key, &head).await;
                }
                Ok(RevalidationOutcome::Replaced) => {
                    context.stats.record_revalidation(RevalidationResult::Replaced);
                }
                Ok(RevalidationOutcome::Failed { error, .. }) => {
                    context.stats.record_revalidation(RevalidationResult::Failed);
                    warn!("Background revalidation of '{}' failed: {}", key.resource_id(), error);
                }
                Err(_) => {
                    context.stats.record_revalidation(RevalidationResult::Failed);
                }
            }
        });
        Some(token)
    }

    /// Revalidates `value` before answering the caller.
    async fn revalidate_inline(
        &self,
        request: DispatchRequest,
        key: CacheKey,
        value: CachedValue,
        chunks: Vec<Bytes>,
        handler: BoxedHandler,
    ) -> bool {
        let signal = request.signal.clone();
        let method = request.method.clone();
        let conditional = conditional_request(&request, &value);
        let (revalidation, outcome) =
            RevalidationHandler::new(CacheHandler::new(Arc::clone(&self.context), key.clone(), handler));
        let completed = self.next.dispatch(conditional, Box::new(revalidation)).await;

        match outcome.await {
            Ok(RevalidationOutcome::NotModified { head, handler }) => {
                self.context
                    .stats
                    .record_revalidation(RevalidationResult::NotModified);
                refresh_entry(&self.context, &key, &head).await;
                let now = self.context.now();
                serve_cached(
                    now,
                    signal.as_ref(),
                    &method,
                    &value,
                    CachedBody::detached(chunks),
                    Box::new(handler.into_inner()),
                    true,
                )
                .await
            }
            Ok(RevalidationOutcome::Replaced) => {
                self.context
                    .stats
                    .record_revalidation(RevalidationResult::Replaced);
                completed
            }
            Ok(RevalidationOutcome::Failed { error, handler }) => {
                self.context
                    .stats
                    .record_revalidation(RevalidationResult::Failed);
                let mut handler: BoxedHandler = Box::new(handler.into_inner());
                let now = self.context.now();
                if within_stale_if_error(now, &value) {
                    debug!(
                        "Revalidation of '{}' failed ({}); serving stale",
                        key.resource_id(),
                        error
                    );
                    self.context.stats.increment_stale_hits();
                    return serve_cached(
                        now,
                        signal.as_ref(),
                        &method,
                        &value,
                        CachedBody::detached(chunks),
                        handler,
                        true,
                    )
                    .await;
                }
                let controller = DispatchController::new(signal.as_ref());
                handler.on_request_start(&controller).await;
                handler.on_response_error(&controller, error).await;
                false
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Dispatcher for CacheInterceptor {
    async fn dispatch(&self, request: DispatchRequest, handler: BoxedHandler) -> bool {
        let key = match request.cache_key() {
            Ok(Some(key)) => key,
            Ok(None) => return self.bypass(request, handler, "no origin").await,
            Err(e) => {
                self.context.report(&e, "building a cache key");
                return self.bypass(request, handler, "invalid key").await;
            }
        };
        // Unsafe methods invalidate whatever their request directives say.
        if is_unsafe_method(key.method()) {
            let handler = CacheHandler::new(Arc::clone(&self.context), key, handler);
            return self.next.dispatch(request, Box::new(handler)).await;
        }
        let directives = CacheControlDirectives::from_headers(&request.headers);
        if directives.no_store {
            return self.bypass(request, handler, "no-store").await;
        }
        if !self.methods.contains(key.method()) {
            return self.bypass(request, handler, "method not cacheable").await;
        }

        let cached = match self.context.store.get(&key).await {
            Ok(cached) => cached,
            Err(e) => {
                self.context.report(&e, "looking up an entry");
                None
            }
        };
        let now = self.context.now();
        let Some(cached) = cached.filter(|c| !c.value().is_expired(now)) else {
            if directives.only_if_cached {
                debug!("No usable entry for only-if-cached request to '{}'", key.resource_id());
                self.context.stats.increment_misses();
                return gateway_timeout(request.signal.as_ref(), handler).await;
            }
            debug!("Cache miss for '{}'", key.resource_id());
            self.context.stats.increment_misses();
            let handler = CacheHandler::new(Arc::clone(&self.context), key, handler);
            return self.next.dispatch(request, Box::new(handler)).await;
        };

        let mut usability = classify(now, cached.value(), &directives);
        if usability == Usability::StaleWhileRevalidate && !self.background_revalidation {
            usability = Usability::Revalidate;
        }
        // only-if-cached never goes to the origin; a stale entry is the best we have.
        if usability == Usability::Revalidate && directives.only_if_cached {
            usability = Usability::StaleAccepted;
        }

        match usability {
            Usability::Fresh => {
                debug!("Fresh cache hit for '{}'", key.resource_id());
                self.context.stats.increment_hits();
                let (value, body) = cached.into_body();
                serve_cached(now, request.signal.as_ref(), &request.method, &value, body, handler, false)
                    .await
            }
            Usability::StaleAccepted => {
                debug!("Serving stale '{}' without revalidation", key.resource_id());
                self.context.stats.increment_stale_hits();
                let (value, body) = cached.into_body();
                serve_cached(now, request.signal.as_ref(), &request.method, &value, body, handler, true)
                    .await
            }
            Usability::StaleWhileRevalidate => {
                debug!("Serving stale '{}' while revalidating", key.resource_id());
                self.context.stats.increment_stale_hits();
                // The background write needs the slot, so serve from a copy.
                let (value, chunks) = cached.detach().into_parts();
                let revalidation = self.spawn_revalidation(&request, &key, &value);
                let served = serve_cached(
                    now,
                    request.signal.as_ref(),
                    &request.method,
                    &value,
                    CachedBody::detached(chunks),
                    handler,
                    true,
                )
                .await;
                if !served {
                    if let Some(token) = revalidation {
                        token.cancel();
                    }
                }
                served
            }
            Usability::Revalidate => {
                debug!("Revalidating stale '{}'", key.resource_id());
                let (value, chunks) = cached.detach().into_parts();
                self.revalidate_inline(request, key, value, chunks, handler)
                    .await
            }
        }
    }
}
