// src/core/dispatch/reqwest_dispatcher.rs

//! A `Dispatcher` backed by `reqwest`, used by the command-line client.

use super::{BoxedHandler, DispatchController, DispatchRequest, Dispatcher, ResponseHead};
use crate::core::errors::DispatchError;
use crate::core::headers::Headers;
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends requests over the network, streaming response bodies to the handler.
#[derive(Debug, Clone)]
pub struct ReqwestDispatcher {
    client: reqwest::Client,
}

impl ReqwestDispatcher {
    pub fn new() -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(DispatchError::from)?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Dispatcher for ReqwestDispatcher {
    async fn dispatch(&self, request: DispatchRequest, mut handler: BoxedHandler) -> bool {
        let controller = DispatchController::new(request.signal.as_ref());
        handler.on_request_start(&controller).await;

        let Some(url) = request.url() else {
            let error = DispatchError::InvalidRequest("request has no origin".into());
            handler.on_response_error(&controller, error).await;
            return false;
        };

        let mut builder = self.client.request(request.method.clone(), &url);
        for (name, value) in request.headers.iter() {
            for v in value.as_slice() {
                builder = builder.header(name, v);
            }
        }
        if let Some(body) = request.body.clone() {
            builder = builder.body(body);
        }

        debug!("Dispatching {} {}", request.method, url);
        let response = tokio::select! {
            res = builder.send() => res,
            _ = controller.cancelled() => {
                handler.on_response_error(&controller, controller.abort_error()).await;
                return false;
            }
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                handler.on_response_error(&controller, e.into()).await;
                return false;
            }
        };

        let status = response.status();
        let mut headers = Headers::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.append(name.as_str(), value);
            }
        }
        let head = ResponseHead::new(
            status.as_u16(),
            status.canonical_reason().unwrap_or_default(),
            headers,
        );
        handler.on_response_start(&controller, &head).await;

        let mut body = response.bytes_stream();
        loop {
            if !controller.wait_until_resumed().await {
                handler.on_response_error(&controller, controller.abort_error()).await;
                return false;
            }
            let next = tokio::select! {
                chunk = body.next() => chunk,
                _ = controller.cancelled() => {
                    handler.on_response_error(&controller, controller.abort_error()).await;
                    return false;
                }
            };
            match next {
                Some(Ok(chunk)) => handler.on_response_data(&controller, chunk).await,
                Some(Err(e)) => {
                    handler.on_response_error(&controller, e.into()).await;
                    return false;
                }
                None => break,
            }
        }

        handler.on_response_end(&controller, &Headers::new()).await;
        true
    }
}
