//! HTTP transport backed by `reqwest`.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{SendOptions, Transport, TransportError};
use crate::http::{Method, Request, Response};

/// Sends requests to `base_url` joined with the request path.
///
/// Requests whose URL is already absolute are sent as-is.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Connection(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, base_url))
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn map_error(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Connection(err.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request, options: &SendOptions) -> Result<Response, TransportError> {
        let _timer = crate::metrics::LatencyTimer::new("http", "send");
        let url = self.resolve(&request.url);
        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &url)
            .timeout(options.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = tokio::select! {
            _ = options.cancel.cancelled() => return Err(TransportError::Aborted),
            result = builder.send() => result.map_err(|e| map_error(e, options.timeout))?,
        };

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(|e| map_error(e, options.timeout))?;

        tracing::debug!(url = %url, status, bytes = body.len(), "HTTP response received");
        Ok(Response { status, headers, body })
    }
}
