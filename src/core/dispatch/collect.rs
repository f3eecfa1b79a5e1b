// src/core/dispatch/collect.rs

//! Small handlers for callers that want a whole response rather than events.

use super::{DispatchController, DispatchHandler, DispatchRequest, Dispatcher, ResponseHead};
use crate::core::errors::DispatchError;
use crate::core::headers::Headers;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::sync::oneshot;

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct CollectedResponse {
    pub head: ResponseHead,
    pub body: Bytes,
    /// Number of `on_response_data` calls the body arrived in.
    pub chunks: usize,
    pub trailers: Headers,
}

impl CollectedResponse {
    pub fn status(&self) -> u16 {
        self.head.status
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.head.headers.get_joined(name)
    }
}

/// Buffers one response and sends it on completion.
struct CollectingHandler {
    head: Option<ResponseHead>,
    body: BytesMut,
    chunks: usize,
    tx: Option<oneshot::Sender<Result<CollectedResponse, DispatchError>>>,
}

impl CollectingHandler {
    fn finish(&mut self, result: Result<CollectedResponse, DispatchError>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }
}

#[async_trait]
impl DispatchHandler for CollectingHandler {
    async fn on_response_start(&mut self, _controller: &Arc<DispatchController>, head: &ResponseHead) {
        self.head = Some(head.clone());
    }

    async fn on_response_data(&mut self, _controller: &Arc<DispatchController>, chunk: Bytes) {
        self.chunks += 1;
        self.body.extend_from_slice(&chunk);
    }

    async fn on_response_end(&mut self, _controller: &Arc<DispatchController>, trailers: &Headers) {
        let result = match self.head.take() {
            Some(head) => Ok(CollectedResponse {
                head,
                body: std::mem::take(&mut self.body).freeze(),
                chunks: self.chunks,
                trailers: trailers.clone(),
            }),
            None => Err(DispatchError::Transport(
                "response ended before it started".into(),
            )),
        };
        self.finish(result);
    }

    async fn on_response_error(&mut self, _controller: &Arc<DispatchController>, error: DispatchError) {
        self.finish(Err(error));
    }
}

/// Dispatches `request` and buffers the whole response.
pub async fn fetch<D: Dispatcher + ?Sized>(
    dispatcher: &D,
    request: DispatchRequest,
) -> Result<CollectedResponse, DispatchError> {
    let (tx, rx) = oneshot::channel();
    let handler = CollectingHandler {
        head: None,
        body: BytesMut::new(),
        chunks: 0,
        tx: Some(tx),
    };
    dispatcher.dispatch(request, Box::new(handler)).await;
    rx.await.unwrap_or_else(|_| {
        Err(DispatchError::Transport(
            "dispatcher dropped the handler without completing it".into(),
        ))
    })
}

/// Discards every event. Background revalidations run with this at the end
/// of their handler chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

#[async_trait]
impl DispatchHandler for NoopHandler {
    async fn on_response_start(&mut self, _controller: &Arc<DispatchController>, _head: &ResponseHead) {}

    async fn on_response_data(&mut self, _controller: &Arc<DispatchController>, _chunk: Bytes) {}

    async fn on_response_end(&mut self, _controller: &Arc<DispatchController>, _trailers: &Headers) {}

    async fn on_response_error(&mut self, _controller: &Arc<DispatchController>, _error: DispatchError) {}
}
