//! Error handling for proxy operations
//!
//! Two delivery paths exist:
//! - Before a response is committed, failures become ordinary HTTP error
//!   responses via [`ProxyError`].
//! - Once a stream response is committed, failures can only be written into
//!   the stream as a [`StreamErrorEvent`] record.

use axum::{
    body::Body,
    http::{Response, StatusCode, header},
    response::IntoResponse,
};
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur during proxy operations
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    /// Client request could not be read or parsed
    #[error("Request error: {0}")]
    Request(String),

    /// Client request body exceeds the configured limit
    #[error("Request too large: {0}")]
    TooLarge(String),

    /// Request named a group that does not exist, or could not be routed
    #[error("Routing error: {0}")]
    Routing(String),

    /// Network-level error (connection, timeout, broken stream)
    #[error("Network error: {0}")]
    Network(String),

    /// Failure inside the proxy itself
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// HTTP status used when this error is returned to the client
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Request(_) | ProxyError::Routing(_) => StatusCode::BAD_REQUEST,
            ProxyError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Network(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ProxyError::Request(_) | ProxyError::TooLarge(_) => "request",
            ProxyError::Routing(_) => "routing",
            ProxyError::Network(_) => "network",
            ProxyError::Internal(_) => "internal",
        }
    }

    /// Map a reqwest send error to a network error with a useful message
    pub fn from_send(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::Network(format!("Request timed out: {err}"))
        } else if err.is_connect() {
            ProxyError::Network(format!("Failed to connect to upstream: {err}"))
        } else {
            ProxyError::Network(format!("Request failed: {err}"))
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let error_body = serde_json::json!({
            "error": {
                "type": format!("{}_error", self.category()),
                "message": self.to_string(),
            }
        });
        json_response(self.status(), error_body.to_string())
    }
}

fn json_response(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

/// An error record written into an open event stream
///
/// Serializes as `data: {"error":{"message":...,"details":...,"group":...}}`
/// followed by the record separator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamErrorEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[derive(Serialize)]
struct StreamErrorEnvelope<'a> {
    error: &'a StreamErrorEvent,
}

impl StreamErrorEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            group: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_group(mut self, group: Option<String>) -> Self {
        self.group = group;
        self
    }

    /// Render as one event-stream record
    pub fn to_sse(&self) -> serde_json::Result<String> {
        let json = serde_json::to_string(&StreamErrorEnvelope { error: self })?;
        Ok(format!("data: {json}\n\n"))
    }
}

impl From<&ProxyError> for StreamErrorEvent {
    fn from(err: &ProxyError) -> Self {
        StreamErrorEvent::new(err.to_string())
    }
}

/// An event-stream response carrying a single error record.
///
/// Used for failures detected before the relay starts, while the status can
/// still reflect the error.
pub fn stream_error_response(status: StatusCode, event: &StreamErrorEvent) -> Response<Body> {
    let body = match event.to_sse() {
        Ok(record) => Body::from(record),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize stream error event");
            Body::empty()
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/event-stream"),
    );
    response
}
