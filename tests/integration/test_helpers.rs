// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use parking_lot::Mutex;
use spinelcache::core::CacheKey;
use spinelcache::core::clock::{ManualClock, SharedClock};
use spinelcache::core::dispatch::{
    BoxedHandler, CollectedResponse, DispatchController, DispatchHandler, DispatchRequest,
    Dispatcher, ResponseHead, fetch,
};
use spinelcache::core::errors::DispatchError;
use spinelcache::core::headers::Headers;
use spinelcache::core::interceptor::{CacheInterceptor, CacheOptions};
use spinelcache::core::storage::{
    CachedValue, MemoryStore, MemoryStoreConfig, SharedStore,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, reload};

/// The origin every test request is sent to.
pub const ORIGIN: &str = "http://origin.test";

/// An arbitrary fixed start time, in epoch milliseconds.
pub const T0: i64 = 1_700_000_000_000;

/// Sets up minimal tracing for tests. Safe to call more than once.
pub fn init_tracing() {
    let (filter, _reload_handle) = reload::Layer::new(EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// One scripted answer of the mock origin.
#[derive(Debug, Clone)]
pub enum Reply {
    Respond {
        status: u16,
        message: String,
        headers: Headers,
        chunks: Vec<Bytes>,
    },
    Fail(DispatchError),
    /// The origin task panics.
    Panic(String),
}

impl Reply {
    /// A `200 OK` with the given `cache-control` and a single-chunk body.
    pub fn ok(cache_control: &str, body: &str) -> Self {
        Reply::Respond {
            status: 200,
            message: "OK".to_string(),
            headers: Headers::from([("cache-control", cache_control)]),
            chunks: vec![Bytes::from(body.to_string())],
        }
    }

    pub fn not_modified(cache_control: &str) -> Self {
        Reply::Respond {
            status: 304,
            message: "Not Modified".to_string(),
            headers: Headers::from([("cache-control", cache_control)]),
            chunks: Vec::new(),
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Reply::Respond {
            status,
            message: String::new(),
            headers: Headers::new(),
            chunks: vec![Bytes::from(body.to_string())],
        }
    }

    pub fn transport_error(message: &str) -> Self {
        Reply::Fail(DispatchError::Transport(message.to_string()))
    }

    pub fn panic(message: &str) -> Self {
        Reply::Panic(message.to_string())
    }

    /// Adds a response header.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let Reply::Respond { headers, .. } = &mut self {
            headers.insert(name, value);
        }
        self
    }

    /// Replaces the body with several chunks.
    pub fn chunks(mut self, parts: &[&str]) -> Self {
        if let Reply::Respond { chunks, .. } = &mut self {
            *chunks = parts.iter().map(|p| Bytes::from(p.to_string())).collect();
        }
        self
    }
}

/// A `Dispatcher` standing in for the network. It records every request and
/// answers from a script; once the script runs out the last reply repeats.
#[derive(Debug, Default)]
pub struct MockOrigin {
    script: Mutex<VecDeque<Reply>>,
    last: Mutex<Option<Reply>>,
    requests: Mutex<Vec<DispatchRequest>>,
    count: AtomicUsize,
}

impl MockOrigin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().push_back(reply);
    }

    pub fn request_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<DispatchRequest> {
        self.requests.lock().last().cloned()
    }

    fn next_reply(&self) -> Reply {
        let mut script = self.script.lock();
        let mut last = self.last.lock();
        if let Some(reply) = script.pop_front() {
            *last = Some(reply.clone());
            return reply;
        }
        last.clone()
            .unwrap_or_else(|| Reply::status(404, "no reply scripted"))
    }
}

#[async_trait]
impl Dispatcher for MockOrigin {
    async fn dispatch(&self, request: DispatchRequest, mut handler: BoxedHandler) -> bool {
        self.count.fetch_add(1, Ordering::SeqCst);
        let controller = DispatchController::new(request.signal.as_ref());
        self.requests.lock().push(request);
        let reply = self.next_reply();

        handler.on_request_start(&controller).await;
        let (status, message, headers, chunks) = match reply {
            Reply::Respond {
                status,
                message,
                headers,
                chunks,
            } => (status, message, headers, chunks),
            Reply::Fail(error) => {
                handler.on_response_error(&controller, error).await;
                return false;
            }
            Reply::Panic(message) => panic!("{message}"),
        };
        if controller.is_aborted() {
            handler
                .on_response_error(&controller, controller.abort_error())
                .await;
            return false;
        }

        let head = ResponseHead::new(status, message, headers);
        handler.on_response_start(&controller, &head).await;
        for chunk in chunks {
            if !controller.wait_until_resumed().await {
                handler
                    .on_response_error(&controller, controller.abort_error())
                    .await;
                return false;
            }
            handler.on_response_data(&controller, chunk).await;
        }
        if controller.is_aborted() {
            handler
                .on_response_error(&controller, controller.abort_error())
                .await;
            return false;
        }
        handler.on_response_end(&controller, &Headers::new()).await;
        true
    }
}

/// What a `RecordingHandler` saw.
#[derive(Debug, Default)]
pub struct Recorded {
    pub head: Option<ResponseHead>,
    pub chunks: Vec<Bytes>,
    pub ended: bool,
    pub error: Option<DispatchError>,
}

/// A handler that records its events and aborts the request once it has
/// received `abort_after` chunks.
pub struct RecordingHandler {
    pub recorded: Arc<Mutex<Recorded>>,
    pub abort_after: Option<usize>,
}

impl RecordingHandler {
    pub fn new(abort_after: Option<usize>) -> (Self, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let handler = Self {
            recorded: Arc::clone(&recorded),
            abort_after,
        };
        (handler, recorded)
    }
}

#[async_trait]
impl DispatchHandler for RecordingHandler {
    async fn on_response_start(&mut self, _controller: &Arc<DispatchController>, head: &ResponseHead) {
        self.recorded.lock().head = Some(head.clone());
    }

    async fn on_response_data(&mut self, controller: &Arc<DispatchController>, chunk: Bytes) {
        let received = {
            let mut recorded = self.recorded.lock();
            recorded.chunks.push(chunk);
            recorded.chunks.len()
        };
        if self.abort_after.is_some_and(|n| received >= n) {
            controller.abort("client went away");
        }
    }

    async fn on_response_end(&mut self, _controller: &Arc<DispatchController>, _trailers: &Headers) {
        self.recorded.lock().ended = true;
    }

    async fn on_response_error(&mut self, _controller: &Arc<DispatchController>, error: DispatchError) {
        self.recorded.lock().error = Some(error);
    }
}

/// TestContext wires a `CacheInterceptor` over a `MockOrigin`, with a manual
/// clock shared by the interceptor and its store.
pub struct TestContext {
    pub clock: Arc<ManualClock>,
    pub origin: Arc<MockOrigin>,
    pub store: SharedStore,
    pub interceptor: CacheInterceptor,
}

impl TestContext {
    /// A context over an unbounded memory store.
    pub fn new() -> Self {
        Self::with_options(|options| options)
    }

    /// A context whose options are adjusted by `configure`.
    pub fn with_options(configure: impl FnOnce(CacheOptions) -> CacheOptions) -> Self {
        let clock = ManualClock::new(T0);
        let store = MemoryStore::new(MemoryStoreConfig {
            clock: clock.clone(),
            ..MemoryStoreConfig::default()
        })
        .expect("valid memory store config");
        Self::with_store(clock, Arc::new(store), configure)
    }

    /// A context over a caller-built store, which must use `clock`.
    pub fn with_store(
        clock: Arc<ManualClock>,
        store: SharedStore,
        configure: impl FnOnce(CacheOptions) -> CacheOptions,
    ) -> Self {
        init_tracing();
        let origin = MockOrigin::new();
        let shared_clock: SharedClock = clock.clone();
        let options = configure(CacheOptions::new(store.clone()).clock(shared_clock));
        let interceptor =
            CacheInterceptor::new(origin.clone(), options).expect("valid cache options");
        Self {
            clock,
            origin,
            store,
            interceptor,
        }
    }

    /// Sets the clock to `T0 + offset_ms`.
    pub fn at(&self, offset_ms: i64) {
        self.clock.set(T0 + offset_ms);
    }

    pub async fn get(&self, path: &str) -> CollectedResponse {
        self.send(request(Method::GET, path)).await
    }

    pub async fn send(&self, request: DispatchRequest) -> CollectedResponse {
        fetch(&self.interceptor, request)
            .await
            .expect("request through the cache failed")
    }

    pub async fn try_send(
        &self,
        request: DispatchRequest,
    ) -> Result<CollectedResponse, DispatchError> {
        fetch(&self.interceptor, request).await
    }

    /// The stored entry for a header-less GET of `path`, with its body joined.
    pub async fn stored(&self, path: &str) -> Option<(CachedValue, Vec<u8>)> {
        let key = key(Method::GET, path, Headers::new());
        self.store
            .get(&key)
            .await
            .expect("store lookup failed")
            .map(|cached| {
                let (value, chunks) = cached.into_parts();
                (value, chunks.concat())
            })
    }
}

pub fn request(method: Method, path: &str) -> DispatchRequest {
    DispatchRequest::new(method, ORIGIN, path)
}

pub fn key(method: Method, path: &str, headers: Headers) -> CacheKey {
    CacheKey::new(ORIGIN, path, method, headers).expect("valid cache key")
}

/// A stored value for tests that talk to a store directly.
pub fn value(cached_at: i64, stale_at: i64, delete_at: i64) -> CachedValue {
    CachedValue {
        status_code: 200,
        status_message: "OK".to_string(),
        headers: Headers::from([("content-type", "text/plain")]),
        vary: None,
        etag: None,
        cached_at,
        stale_at,
        delete_at,
    }
}

pub fn body_of(response: &CollectedResponse) -> String {
    String::from_utf8_lossy(&response.body).into_owned()
}
