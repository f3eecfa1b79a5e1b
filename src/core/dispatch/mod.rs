// src/core/dispatch/mod.rs

//! The dispatcher/handler contract the cache sits behind and in front of.
//!
//! A `Dispatcher` takes a request description and a `DispatchHandler`, and
//! drives the handler through its lifecycle:
//!
//! `on_request_start` -> `on_request_upgrade`? -> `on_response_start` ->
//! `on_response_data`* -> (`on_response_end` | `on_response_error`)
//!
//! An error may also arrive straight after `on_request_start`, before any
//! response has started.

pub mod collect;
pub mod reqwest_dispatcher;

use crate::core::errors::{CacheError, DispatchError};
use crate::core::headers::Headers;
use crate::core::key::CacheKey;
use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use collect::{CollectedResponse, NoopHandler, fetch};
pub use reqwest_dispatcher::ReqwestDispatcher;

/// A request as seen by dispatchers and the cache.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Scheme and authority, e.g. `https://example.com`. Requests without an
    /// origin are never cached.
    pub origin: Option<String>,
    /// Path plus query string, starting with `/`.
    pub path: String,
    pub method: Method,
    pub headers: Headers,
    pub body: Option<Bytes>,
    /// Cancelling this token aborts the request.
    pub signal: Option<CancellationToken>,
}

impl DispatchRequest {
    pub fn new(method: Method, origin: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
            path: path.into(),
            method,
            headers: Headers::new(),
            body: None,
            signal: None,
        }
    }

    /// Splits an absolute URL into origin and path.
    pub fn from_url(method: Method, raw: &str) -> Result<Self, DispatchError> {
        let url = url::Url::parse(raw)
            .map_err(|e| DispatchError::InvalidRequest(format!("invalid url '{raw}': {e}")))?;
        if !url.has_host() {
            return Err(DispatchError::InvalidRequest(format!(
                "url '{raw}' has no host"
            )));
        }
        let origin = url.origin().ascii_serialization();
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(Self::new(method, origin, path))
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    /// The absolute URL, when the request has an origin.
    pub fn url(&self) -> Option<String> {
        self.origin
            .as_ref()
            .map(|origin| format!("{}{}", origin.trim_end_matches('/'), self.path))
    }

    /// The cache key for this request, or `None` when it has no origin.
    pub fn cache_key(&self) -> Result<Option<CacheKey>, CacheError> {
        match &self.origin {
            None => Ok(None),
            Some(origin) => CacheKey::new(
                origin.clone(),
                self.path.clone(),
                self.method.clone(),
                self.headers.clone(),
            )
            .map(Some),
        }
    }
}

/// Status line and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub status_message: String,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn new(status: u16, status_message: impl Into<String>, headers: Headers) -> Self {
        Self {
            status,
            status_message: status_message.into(),
            headers,
        }
    }
}

/// Flow control for one request: abort plus pause/resume backpressure.
///
/// Handed to every handler callback. Whoever drives the lifecycle checks it
/// between chunks.
#[derive(Debug)]
pub struct DispatchController {
    reason: Mutex<Option<String>>,
    token: CancellationToken,
    paused: watch::Sender<bool>,
}

impl DispatchController {
    /// A controller that is also aborted when `signal` is cancelled.
    pub fn new(signal: Option<&CancellationToken>) -> Arc<Self> {
        let token = signal.map_or_else(CancellationToken::new, |s| s.child_token());
        let (paused, _) = watch::channel(false);
        Arc::new(Self {
            reason: Mutex::new(None),
            token,
            paused,
        })
    }

    /// Aborts the request. The first reason given is kept.
    pub fn abort(&self, reason: impl Into<String>) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn abort_reason(&self) -> Option<String> {
        if let Some(reason) = self.reason.lock().clone() {
            return Some(reason);
        }
        self.is_aborted().then(|| "request signal cancelled".to_string())
    }

    /// The error to report for an aborted request.
    pub fn abort_error(&self) -> DispatchError {
        DispatchError::Aborted(
            self.abort_reason()
                .unwrap_or_else(|| "request aborted".to_string()),
        )
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Resolves once the request is aborted.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Waits while paused. Returns `false` if the request is aborted instead.
    pub async fn wait_until_resumed(&self) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if self.is_aborted() {
                return false;
            }
            let paused = *rx.borrow_and_update();
            if !paused {
                return true;
            }
            tokio::select! {
                res = rx.changed() => {
                    if res.is_err() {
                        return !self.is_aborted();
                    }
                }
                _ = self.token.cancelled() => return false,
            }
        }
    }
}

/// Receives the events of one request.
#[async_trait]
pub trait DispatchHandler: Send {
    async fn on_request_start(&mut self, _controller: &Arc<DispatchController>) {}

    async fn on_request_upgrade(
        &mut self,
        _controller: &Arc<DispatchController>,
        _head: &ResponseHead,
    ) {
    }

    async fn on_response_start(&mut self, controller: &Arc<DispatchController>, head: &ResponseHead);

    async fn on_response_data(&mut self, controller: &Arc<DispatchController>, chunk: Bytes);

    async fn on_response_end(&mut self, controller: &Arc<DispatchController>, trailers: &Headers);

    async fn on_response_error(&mut self, controller: &Arc<DispatchController>, error: DispatchError);
}

pub type BoxedHandler = Box<dyn DispatchHandler>;

#[async_trait]
impl<H: DispatchHandler + ?Sized> DispatchHandler for Box<H> {
    async fn on_request_start(&mut self, controller: &Arc<DispatchController>) {
        (**self).on_request_start(controller).await
    }

    async fn on_request_upgrade(&mut self, controller: &Arc<DispatchController>, head: &ResponseHead) {
        (**self).on_request_upgrade(controller, head).await
    }

    async fn on_response_start(&mut self, controller: &Arc<DispatchController>, head: &ResponseHead) {
        (**self).on_response_start(controller, head).await
    }

    async fn on_response_data(&mut self, controller: &Arc<DispatchController>, chunk: Bytes) {
        (**self).on_response_data(controller, chunk).await
    }

    async fn on_response_end(&mut self, controller: &Arc<DispatchController>, trailers: &Headers) {
        (**self).on_response_end(controller, trailers).await
    }

    async fn on_response_error(&mut self, controller: &Arc<DispatchController>, error: DispatchError) {
        (**self).on_response_error(controller, error).await
    }
}

/// Anything that can carry a request to completion.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Runs the request, driving `handler` through its lifecycle. Returns
    /// `true` when the lifecycle ended with `on_response_end`.
    async fn dispatch(&self, request: DispatchRequest, handler: BoxedHandler) -> bool;
}

#[async_trait]
impl<T: Dispatcher + ?Sized> Dispatcher for Arc<T> {
    async fn dispatch(&self, request: DispatchRequest, handler: BoxedHandler) -> bool {
        (**self).dispatch(request, handler).await
    }
}
