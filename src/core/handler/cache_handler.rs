// src/core/handler/cache_handler.rs

//! Tees a live response into the store while passing every event through.

use crate::core::directives::CacheControlDirectives;
use crate::core::dispatch::{DispatchController, DispatchHandler, ResponseHead};
use crate::core::errors::{CacheError, DispatchError};
use crate::core::freshness::{compute_delete_at, compute_stale_at, parse_vary};
use crate::core::headers::Headers;
use crate::core::interceptor::CacheContext;
use crate::core::key::CacheKey;
use crate::core::policy::{is_storable, is_strong_etag, is_unsafe_method, strip_headers};
use crate::core::storage::{CacheWriter, CachedValue};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Wraps a handler and stores the response it sees when it is cacheable.
///
/// For unsafe methods it instead invalidates the resource once the origin
/// answers with a 2xx or 3xx status. Store failures never reach the wrapped
/// handler.
pub struct CacheHandler<H> {
    context: Arc<CacheContext>,
    key: CacheKey,
    inner: H,
    writer: Option<Box<dyn CacheWriter>>,
}

impl<H: DispatchHandler> CacheHandler<H> {
    pub(crate) fn new(context: Arc<CacheContext>, key: CacheKey, inner: H) -> Self {
        Self {
            context,
            key,
            inner,
            writer: None,
        }
    }

    pub fn into_inner(self) -> H {
        self.inner
    }

    /// The entry to store for `head`, or `None` when it must not be cached.
    fn cacheable_value(&self, head: &ResponseHead) -> Option<CachedValue> {
        let now = self.context.now();
        let cache_type = self.context.cache_type;
        let directives = CacheControlDirectives::from_headers(&head.headers);

        if !is_storable(
            cache_type,
            head.status,
            self.key.headers(),
            &head.headers,
            &directives,
        ) {
            return None;
        }
        let stale_at = compute_stale_at(now, &head.headers, &directives, cache_type)?;
        let delete_at = compute_delete_at(stale_at, &directives);
        if delete_at <= now {
            return None;
        }

        let vary = head
            .headers
            .get("vary")
            .map(|vary| parse_vary(vary, self.key.headers()));
        let etag = head
            .headers
            .first("etag")
            .filter(|etag| is_strong_etag(etag))
            .map(str::to_string);

        Some(CachedValue {
            status_code: head.status,
            status_message: head.status_message.clone(),
            headers: strip_headers(&head.headers, &directives),
            vary,
            etag,
            cached_at: now,
            stale_at,
            delete_at,
        })
    }

    fn write_failed(&mut self, error: CacheError) {
        self.writer = None;
        match error {
            CacheError::EntryTooLarge { limit } => debug!(
                "Not caching '{}': body exceeds {} bytes",
                self.key.resource_id(),
                limit
            ),
            other => self.context.report(&other, "writing an entry"),
        }
    }
}

async fn invalidate(context: &CacheContext, key: &CacheKey) {
    match context.store.delete(key).await {
        Ok(()) => {
            context.stats.increment_invalidations();
            debug!("Invalidated cached '{}'", key.resource_id());
        }
        Err(e) => context.report(&e, "invalidating an entry"),
    }
}

#[async_trait]
impl<H: DispatchHandler> DispatchHandler for CacheHandler<H> {
    async fn on_request_start(&mut self, controller: &Arc<DispatchController>) {
        self.inner.on_request_start(controller).await
    }

    async fn on_request_upgrade(&mut self, controller: &Arc<DispatchController>, head: &ResponseHead) {
        self.inner.on_request_upgrade(controller, head).await
    }

    async fn on_response_start(&mut self, controller: &Arc<DispatchController>, head: &ResponseHead) {
        if is_unsafe_method(self.key.method()) {
            if (200..400).contains(&head.status) {
                invalidate(&self.context, &self.key).await;
            }
        } else if let Some(value) = self.cacheable_value(head) {
            match self
                .context
                .store
                .create_write_stream(&self.key, value)
                .await
            {
                Ok(Some(writer)) => self.writer = Some(writer),
                Ok(None) => debug!("Store refused to cache '{}'", self.key.resource_id()),
                Err(e) => self.context.report(&e, "opening a write stream"),
            }
        }
        self.inner.on_response_start(controller, head).await
    }

    async fn on_response_data(&mut self, controller: &Arc<DispatchController>, chunk: Bytes) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.write(chunk.clone()).await {
                self.write_failed(e);
            }
        }
        self.inner.on_response_data(controller, chunk).await
    }

    async fn on_response_end(&mut self, controller: &Arc<DispatchController>, trailers: &Headers) {
        if let Some(writer) = self.writer.take() {
            match writer.finish().await {
                Ok(()) => {
                    self.context.stats.increment_stores();
                    debug!("Cached '{}'", self.key.resource_id());
                }
                Err(e) => self.write_failed(e),
            }
        }
        self.inner.on_response_end(controller, trailers).await
    }

    async fn on_response_error(&mut self, controller: &Arc<DispatchController>, error: DispatchError) {
        // Dropping the writer discards whatever was buffered.
        self.writer = None;
        self.inner.on_response_error(controller, error).await
    }
}
