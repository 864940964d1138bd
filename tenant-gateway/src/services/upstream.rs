//! Client for the upstream query backend.
//!
//! Requests are relayed as plain GETs; the upstream's status and body are
//! passed back untouched.

use axum::body::Bytes;
use axum::http::{header, HeaderValue, StatusCode};
use reqwest::{Client, Url};
use service_core::observability::TracedClientExt;
use std::time::Duration;

use crate::handlers::params::QueryParams;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid upstream URL: {0}")]
    InvalidUrl(String),

    #[error("request path would change when forwarded: {0}")]
    PathChanged(String),

    #[error("failed to build upstream client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("failed to forward request to upstream: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("failed to read upstream response: {0}")]
    Body(#[source] reqwest::Error),
}

/// Upstream reply, relayed verbatim.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

pub struct UpstreamClient {
    client: Client,
    host: String,
}

impl UpstreamClient {
    /// `host` is `host:port`; every call is bounded by `timeout`.
    pub fn new(host: impl Into<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(timeout)
            // Upstream redirects are relayed to the caller, never followed.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(UpstreamError::Client)?;

        Ok(Self {
            client,
            host: host.into(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// `http://{host}{path}?{params}`, with the inbound request path preserved.
    ///
    /// URL parsing resolves dot segments (`..`, `%2e%2e`); a path it would
    /// alter is refused rather than sent to a different endpoint.
    pub fn build_url(&self, path: &str, params: &QueryParams) -> Result<Url, UpstreamError> {
        let mut url = Url::parse(&format!("http://{}", self.host))
            .map_err(|e| UpstreamError::InvalidUrl(format!("{}: {}", self.host, e)))?;
        url.set_path(path);
        if url.path() != path {
            return Err(UpstreamError::PathChanged(path.to_string()));
        }

        let query = params.encode();
        url.set_query((!query.is_empty()).then_some(query.as_str()));

        Ok(url)
    }

    /// Issue the GET and collect the full upstream reply.
    ///
    /// The future owns the outbound connection: dropping it (inbound client
    /// disconnect) aborts the upstream call.
    pub async fn forward(
        &self,
        path: &str,
        params: &QueryParams,
        request_id: Option<&str>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let url = self.build_url(path, params)?;

        tracing::debug!(upstream_url = %url, "Forwarding request to upstream");

        let response = self
            .client
            .traced_get(url)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )
            .request_id(request_id)
            .send()
            .await
            .map_err(UpstreamError::Transport)?;

        let status = response.status();
        let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
        let body = response.bytes().await.map_err(UpstreamError::Body)?;

        tracing::debug!(status = %status, bytes = body.len(), "Upstream responded");

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}
