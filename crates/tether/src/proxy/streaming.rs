//! Streaming request handling
//!
//! The response is committed as soon as the client channel exists. A detached
//! task runs the relay engine as the channel's producer, so anything that
//! goes wrong afterwards is reported in-band as an error event.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Response, StatusCode, header},
    response::IntoResponse,
};
use bytes::Bytes;
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;
use uuid::Uuid;

use super::error::{ProxyError, StreamErrorEvent, stream_error_response};
use super::passthrough::read_body;
use super::routing::Route;
use super::server::AppState;
use crate::relay::{
    HttpTransport, RelayConfig, RelayEngine, RelayOutcome, RequestPayload, Sleeper,
    UpstreamTransport,
};

/// Records buffered between the engine and a slow client
const CHANNEL_CAPACITY: usize = 64;

const PANIC_MESSAGE: &str = "Relay task terminated unexpectedly";

/// Start relaying a streaming request and return the event-stream response.
pub async fn relay_stream(
    state: Arc<AppState>,
    route: Route,
    headers: HeaderMap,
    body: Body,
) -> Response<Body> {
    let payload = match read_payload(&headers, body, state.config.proxy.max_body_bytes).await {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(group = %route.group, error = %e, "Rejecting streaming request");
            let event = StreamErrorEvent::from(&e).with_group(Some(route.group.clone()));
            return stream_error_response(e.status(), &event);
        }
    };

    let (tx, rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

    let response = match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"))
        .header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))
        .body(Body::from_stream(
            ReceiverStream::new(rx).map(Ok::<_, Infallible>),
        )) {
        Ok(response) => response,
        Err(e) => {
            return ProxyError::Internal(format!("Failed to build response: {e}")).into_response();
        }
    };

    let transport = HttpTransport::new(
        state.client.clone(),
        route.target.clone(),
        route.upstream_headers(&headers),
    );
    let config = RelayConfig::from_retry(&state.config.retry, Some(route.group.clone()));
    let engine = RelayEngine::new(transport, config, payload, tx.clone());

    let span = tracing::info_span!(
        "relay",
        request_id = %Uuid::new_v4(),
        group = %route.group,
    );
    tokio::spawn(supervise(engine, tx, route.group).instrument(span));

    response
}

async fn read_payload(
    headers: &HeaderMap,
    body: Body,
    limit: usize,
) -> Result<RequestPayload, ProxyError> {
    let bytes = read_body(headers, body, limit).await?;
    RequestPayload::from_slice(&bytes)
}

/// Run the engine on its own task so a panic still gets reported to the
/// client through `guard` before the stream closes.
async fn supervise<T, S>(engine: RelayEngine<T, S>, guard: mpsc::Sender<Bytes>, group: String)
where
    T: UpstreamTransport + 'static,
    S: Sleeper + 'static,
{
    tracing::info!("Relay started");
    let handle = tokio::spawn(engine.run().in_current_span());

    match handle.await {
        Ok(report) => {
            let chars = report.accumulated_text.chars().count();
            match report.outcome {
                RelayOutcome::Completed => tracing::info!(
                    attempts = report.attempts,
                    lines = report.forwarded_lines,
                    chars,
                    "Relay completed"
                ),
                outcome => tracing::warn!(
                    ?outcome,
                    attempts = report.attempts,
                    lines = report.forwarded_lines,
                    chars,
                    "Relay ended without completion"
                ),
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Relay task failed");
            let event = StreamErrorEvent::new(PANIC_MESSAGE)
                .with_details(e.to_string())
                .with_group(Some(group));
            if let Ok(record) = event.to_sse() {
                let _ = guard.send(Bytes::from(record)).await;
            }
        }
    }
}
