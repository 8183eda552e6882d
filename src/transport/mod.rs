// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport port.
//!
//! The engine never talks to the network directly. Everything goes through
//! a [`Transport`], which a host backs with a real HTTP client
//! ([`http::HttpTransport`]) or a scripted double in tests.
//!
//! [`send_with_timeout`] is the single place where the per-call timeout is
//! enforced: when it elapses the in-flight future is dropped (aborting the
//! request) and a [`TransportError::Timeout`] is returned.

pub mod http;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::http::{Request, Response};

/// Network-level failure. Every variant is retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request aborted")]
    Aborted,
    #[error("connection failed: {0}")]
    Connection(String),
}

/// Per-call options handed to the transport.
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub timeout: Duration,
    /// Fires when the caller gives up (shutdown, drain cancellation)
    pub cancel: CancellationToken,
}

impl SendOptions {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request. Non-2xx statuses are returned as `Ok`; only failures to
    /// obtain a response at all are errors.
    async fn send(&self, request: Request, options: &SendOptions) -> Result<Response, TransportError>;
}

/// Send through `transport`, enforcing the timeout and cancellation in `options`.
pub async fn send_with_timeout(
    transport: &dyn Transport,
    request: Request,
    options: &SendOptions,
) -> Result<Response, TransportError> {
    let url = request.url.clone();
    tokio::select! {
        biased;
        _ = options.cancel.cancelled() => {
            tracing::debug!(url = %url, "Request aborted by cancellation");
            Err(TransportError::Aborted)
        }
        result = tokio::time::timeout(options.timeout, transport.send(request, options)) => {
            match result {
                Ok(inner) => inner,
                Err(_) => {
                    tracing::debug!(url = %url, timeout = ?options.timeout, "Request timed out");
                    crate::metrics::record_timeout("transport");
                    Err(TransportError::Timeout(options.timeout))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowTransport(Duration);

    #[async_trait]
    impl Transport for SlowTransport {
        async fn send(&self, _request: Request, _options: &SendOptions) -> Result<Response, TransportError> {
            tokio::time::sleep(self.0).await;
            Ok(Response::ok("late"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_enforced() {
        let transport = SlowTransport(Duration::from_secs(10));
        let result = send_with_timeout(&transport, Request::get("/slow"), &SendOptions::new(Duration::from_secs(1))).await;
        assert_eq!(result, Err(TransportError::Timeout(Duration::from_secs(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_response_passes_through() {
        let transport = SlowTransport(Duration::from_millis(10));
        let result = send_with_timeout(&transport, Request::get("/fast"), &SendOptions::new(Duration::from_secs(1))).await;
        assert_eq!(result.unwrap().status, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts() {
        let transport = SlowTransport(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = SendOptions::new(Duration::from_secs(30)).with_cancel(cancel);
        let result = send_with_timeout(&transport, Request::get("/x"), &options).await;
        assert_eq!(result, Err(TransportError::Aborted));
    }
}
