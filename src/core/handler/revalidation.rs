// src/core/handler/revalidation.rs

//! The handler used for conditional requests against a stale entry.

use crate::core::dispatch::{DispatchController, DispatchHandler, ResponseHead};
use crate::core::errors::DispatchError;
use crate::core::headers::Headers;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::oneshot;

/// What the origin said about the stale entry.
#[derive(Debug)]
pub enum RevalidationOutcome<H> {
    /// `304 Not Modified`: the stored copy is still valid. The wrapped handler
    /// never saw an event and is handed back.
    NotModified { head: ResponseHead, handler: H },
    /// Any other status: the response was forwarded to the wrapped handler.
    Replaced,
    /// The request failed before a response started. The wrapped handler
    /// never saw an event and is handed back.
    Failed { error: DispatchError, handler: H },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Forwarding,
    Suppressed,
}

/// Interprets the answer to a conditional request.
///
/// The wrapped handler is started lazily, only when the origin sends a new
/// representation, so that on `304` or an early failure the caller can still
/// serve the stored copy through it.
pub struct RevalidationHandler<H> {
    inner: Option<H>,
    tx: Option<oneshot::Sender<RevalidationOutcome<H>>>,
    phase: Phase,
}

impl<H: DispatchHandler> RevalidationHandler<H> {
    pub fn new(inner: H) -> (Self, oneshot::Receiver<RevalidationOutcome<H>>) {
        let (tx, rx) = oneshot::channel();
        let handler = Self {
            inner: Some(inner),
            tx: Some(tx),
            phase: Phase::Waiting,
        };
        (handler, rx)
    }

    fn settle(&mut self, outcome: RevalidationOutcome<H>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

#[async_trait]
impl<H: DispatchHandler> DispatchHandler for RevalidationHandler<H> {
    async fn on_response_start(&mut self, controller: &Arc<DispatchController>, head: &ResponseHead) {
        if self.phase != Phase::Waiting {
            return;
        }
        if head.status == 304 {
            self.phase = Phase::Suppressed;
            if let Some(handler) = self.inner.take() {
                self.settle(RevalidationOutcome::NotModified {
                    head: head.clone(),
                    handler,
                });
            }
            return;
        }

        self.phase = Phase::Forwarding;
        self.settle(RevalidationOutcome::Replaced);
        if let Some(inner) = self.inner.as_mut() {
            inner.on_request_start(controller).await;
            inner.on_response_start(controller, head).await;
        }
    }

    async fn on_response_data(&mut self, controller: &Arc<DispatchController>, chunk: Bytes) {
        if self.phase == Phase::Forwarding {
            if let Some(inner) = self.inner.as_mut() {
                inner.on_response_data(controller, chunk).await;
            }
        }
    }

    async fn on_response_end(&mut self, controller: &Arc<DispatchController>, trailers: &Headers) {
        if self.phase == Phase::Forwarding {
            if let Some(inner) = self.inner.as_mut() {
                inner.on_response_end(controller, trailers).await;
            }
        }
    }

    async fn on_response_error(&mut self, controller: &Arc<DispatchController>, error: DispatchError) {
        match self.phase {
            Phase::Waiting => {
                self.phase = Phase::Suppressed;
                if let Some(handler) = self.inner.take() {
                    self.settle(RevalidationOutcome::Failed { error, handler });
                }
            }
            Phase::Forwarding => {
                if let Some(inner) = self.inner.as_mut() {
                    inner.on_response_error(controller, error).await;
                }
            }
            // A broken 304 body changes nothing.
            Phase::Suppressed => {}
        }
    }
}

impl<H> Drop for RevalidationHandler<H> {
    fn drop(&mut self) {
        if let (Some(tx), Some(handler)) = (self.tx.take(), self.inner.take()) {
            let _ = tx.send(RevalidationOutcome::Failed {
                error: DispatchError::Aborted("revalidation ended without a response".into()),
                handler,
            });
        }
    }
}
