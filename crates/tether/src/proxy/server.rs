//! HTTP proxy server
//!
//! Every request except `/health` goes through the fallback handler, which
//! resolves a route and then either relays a stream with resumption or
//! forwards the request as-is.

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{Method, Response},
    response::IntoResponse,
    routing::get,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::passthrough::forward_request;
use super::routing::Route;
use super::streaming::relay_stream;
use crate::config::Config;
use crate::error::{Result, TetherError};

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Immutable process configuration
    pub config: Arc<Config>,
    /// HTTP client for upstream requests
    pub client: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let client = build_client(&config)?;
        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }
}

/// The main proxy server
pub struct ProxyServer {
    config: Config,
}

impl ProxyServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Start the proxy server and listen for requests
    pub async fn serve(&self) -> Result<()> {
        let app_state = Arc::new(AppState::new(self.config.clone())?);
        let app = create_router(app_state);

        let addr: SocketAddr = self
            .config
            .proxy
            .listen_addr
            .parse()
            .map_err(|e| TetherError::Config(format!("Invalid listen address: {e}")))?;

        tracing::info!("Starting proxy server on {addr}");
        tracing::info!("Upstream URL: {}", self.config.proxy.upstream_url);
        tracing::info!(
            "Default group '{}', {} named groups",
            self.config.routing.default_group,
            self.config.routing.groups.len()
        );
        tracing::info!(
            "Resuming interrupted streams up to {} consecutive failures, {} ms apart",
            self.config.retry.max_consecutive_failures,
            self.config.retry.retry_delay_ms
        );

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TetherError::Proxy(format!("Failed to bind to {addr}: {e}")))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| TetherError::Proxy(format!("Server error: {e}")))?;

        tracing::info!("Proxy server shut down gracefully");
        Ok(())
    }
}

/// Build the shared upstream client
///
/// Only connecting and idle reads are bounded. Generation streams can run
/// for minutes, so there is no deadline on the call as a whole.
pub fn build_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.proxy.connect_timeout_secs))
        .read_timeout(Duration::from_secs(config.proxy.read_timeout_secs))
        .build()
        .map_err(|e| TetherError::Proxy(format!("Failed to create HTTP client: {e}")))
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .fallback(proxy_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Health check endpoint - returns JSON status
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Route a request, then relay it as a stream or forward it plainly.
async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
) -> Response<Body> {
    let (parts, body) = request.into_parts();

    let route = match Route::resolve(&state.config, &parts.uri, &parts.headers) {
        Ok(route) => route,
        Err(e) => {
            tracing::warn!(path = %parts.uri.path(), error = %e, "Failed to route request");
            return e.into_response();
        }
    };

    tracing::debug!(
        group = %route.group,
        source = ?route.source,
        streaming = route.streaming,
        "Routed request"
    );

    if route.streaming && parts.method == Method::POST {
        return relay_stream(state, route, parts.headers, body).await;
    }

    match forward_request(&state, &route, parts.method, &parts.headers, body).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(group = %route.group, error = %e, "Forwarding failed");
            e.into_response()
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
