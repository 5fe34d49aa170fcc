//! Plain forwarding for non-streaming requests

use axum::{
    body::Body,
    http::{HeaderMap, Method, Response, StatusCode, header},
};
use bytes::Bytes;

use super::ProxyError;
use super::routing::{HOP_BY_HOP_HEADERS, Route};
use super::server::AppState;

/// Forward a request unchanged (apart from routing headers) and pass the
/// upstream response straight back.
pub async fn forward_request(
    state: &AppState,
    route: &Route,
    method: Method,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response<Body>, ProxyError> {
    let body_bytes = read_body(headers, body, state.config.proxy.max_body_bytes).await?;

    tracing::debug!(
        group = %route.group,
        target = %route.target,
        bytes = body_bytes.len(),
        "Forwarding request"
    );

    let response = state
        .client
        .request(method, route.target.clone())
        .headers(route.upstream_headers(headers))
        .body(body_bytes)
        .send()
        .await
        .map_err(|e| ProxyError::from_send(&e))?;

    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers().iter() {
        if !HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            builder = builder.header(name, value);
        }
    }

    builder
        .body(Body::from_stream(response.bytes_stream()))
        .map_err(|e| ProxyError::Internal(format!("Failed to build response: {e}")))
}

/// Buffer a client body, refusing anything over `limit` bytes.
///
/// A declared `Content-Length` over the limit is rejected before reading.
/// An undeclared body is read up to the limit and fails as a request error
/// past it.
pub(crate) async fn read_body(
    headers: &HeaderMap,
    body: Body,
    limit: usize,
) -> Result<Bytes, ProxyError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    if let Some(len) = declared.filter(|&len| len > limit as u64) {
        return Err(ProxyError::TooLarge(format!(
            "body of {len} bytes exceeds the {limit} byte limit"
        )));
    }

    axum::body::to_bytes(body, limit)
        .await
        .map_err(|e| ProxyError::Request(format!("Failed to read request body: {e}")))
}
