//! Upstream transport seam
//!
//! The engine only needs "send this body, give me a status and a byte
//! stream". [`HttpTransport`] does that over reqwest; tests script it.

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use std::sync::Arc;
use url::Url;

use crate::proxy::ProxyError;

/// Upstream response body as a stream of chunks
pub type ByteStream = BoxStream<'static, Result<Bytes, ProxyError>>;

/// One opened upstream call
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub body: ByteStream,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Performs one upstream call per attempt
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// POST `body` upstream and return the response head with its body stream.
    ///
    /// Non-success statuses are returned as responses. An error is a
    /// retryable transport failure, except [`ProxyError::Internal`], which
    /// ends the relay.
    async fn open(&self, body: Bytes) -> Result<UpstreamResponse, ProxyError>;
}

#[async_trait]
impl<T: UpstreamTransport + ?Sized> UpstreamTransport for Arc<T> {
    async fn open(&self, body: Bytes) -> Result<UpstreamResponse, ProxyError> {
        (**self).open(body).await
    }
}

/// Transport backed by a shared reqwest client
pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, url: Url, headers: HeaderMap) -> Self {
        Self {
            client,
            url,
            headers,
        }
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn open(&self, body: Bytes) -> Result<UpstreamResponse, ProxyError> {
        let response = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body)
            .send()
            .await
            .map_err(|e| ProxyError::from_send(&e))?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);

        let body = response
            .bytes_stream()
            .map_err(|e| ProxyError::Network(format!("Upstream stream failed: {e}")))
            .boxed();

        Ok(UpstreamResponse { status, body })
    }
}
