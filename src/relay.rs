//! Upstream relay.
//!
//! Sends the decorated request to the mock engine and streams the answer
//! back unchanged apart from hop-by-hop headers.

use crate::error::RelayError;
use crate::request::{strip_hop_by_hop, ProxyRequest, ProxyResponse};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::header;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

/// Where resolved requests are sent.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send `request` and return the response head with a streaming body.
    ///
    /// `deadline` is the end of the whole request's time budget, which may
    /// already be partly spent reading the client body.
    async fn forward(&self, request: ProxyRequest, deadline: Instant) -> Result<ProxyResponse, RelayError>;
}

/// HTTP relay to the upstream mock engine over a pooled client.
pub struct HttpRelay {
    client: reqwest::Client,
    base: Url,
    /// Configured per-request budget, reported in timeout errors
    timeout: Duration,
}

impl HttpRelay {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| RelayError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base,
            timeout,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Upstream URL for a request: base path joined with the raw path and query.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.base.clone();
        let joined = format!("{}{}", self.base.path().trim_end_matches('/'), path);
        url.set_path(&joined);
        url.set_query(query);
        url
    }

    fn timeout_error(&self) -> RelayError {
        RelayError::Timeout {
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    fn classify(&self, err: reqwest::Error) -> RelayError {
        if err.is_timeout() {
            self.timeout_error()
        } else {
            RelayError::Unreachable(err.to_string())
        }
    }
}

#[async_trait]
impl Upstream for HttpRelay {
    async fn forward(&self, request: ProxyRequest, deadline: Instant) -> Result<ProxyResponse, RelayError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(self.timeout_error());
        }
        let url = self.target_url(&request.path, request.query.as_deref());

        let mut headers = request.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        debug!(
            method = %request.method,
            url = %url,
            remaining_ms = remaining.as_millis() as u64,
            "Forwarding to upstream"
        );

        let mut builder = self
            .client
            .request(request.method, url)
            .headers(headers)
            // Covers the body transfer as well as the wait for headers
            .timeout(remaining);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = match tokio::time::timeout_at(deadline, builder.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(self.classify(e)),
            Err(_) => return Err(self.timeout_error()),
        };

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);

        Ok(ProxyResponse {
            status,
            headers,
            body: Body::from_stream(response.bytes_stream()),
        })
    }
}
