//! Integration tests for the HTTP proxy
//!
//! Runs the full router against wiremock upstreams: plain forwarding,
//! group routing, and streaming relays with resumption.

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt;
use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

use tether::config::{Config, GroupConfig};
use tether::proxy::{AppState, create_router};
use tether::relay::CONTINUATION_PROMPT;
use tether::testing::{finish_line, text_finish_line, text_line};

// =============================================================================
// Test Fixtures
// =============================================================================

const STREAM_PATH: &str = "/v1beta/models/gemini-pro:streamGenerateContent";
const UNARY_PATH: &str = "/v1beta/models/gemini-pro:generateContent";

fn test_config(upstream: &str, max_failures: u32) -> Config {
    let mut config = Config::default();
    config.proxy.upstream_url = upstream.to_string();
    config.retry.max_consecutive_failures = max_failures;
    config.retry.retry_delay_ms = 1;
    config.routing.groups.insert(
        "alpha".to_string(),
        GroupConfig {
            path: "/alpha".to_string(),
            upstream_url: None,
        },
    );
    config
}

fn test_router(config: Config) -> axum::Router {
    create_router(Arc::new(AppState::new(config).unwrap()))
}

fn chat_request() -> serde_json::Value {
    serde_json::json!({
        "contents": [{"role": "user", "parts": [{"text": "Tell me a story"}]}],
        "generationConfig": {"temperature": 0.7}
    })
}

fn sse_body(lines: &[String]) -> String {
    lines.iter().map(|l| format!("{l}\n\n")).collect()
}

fn sse_response(lines: &[String]) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(sse_body(lines))
}

fn stream_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-goog-api-key", "secret")
        .body(Body::from(chat_request().to_string()))
        .unwrap()
}

async fn body_string(response: axum::http::Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// =============================================================================
// Plain Forwarding Tests
// =============================================================================

mod passthrough_tests {
    use super::*;

    #[tokio::test]
    async fn test_unary_request_forwarded_to_group_path() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path(format!("/alpha{UNARY_PATH}")))
            .and(matchers::header("x-goog-api-key", "secret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"candidates": []})),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let request = Request::builder()
            .method("POST")
            .uri(UNARY_PATH)
            .header("content-type", "application/json")
            .header("x-goog-api-key", "alpha:secret")
            .body(Body::from(chat_request().to_string()))
            .unwrap();

        let response = test_router(test_config(&mock_server.uri(), 5))
            .oneshot(request)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["candidates"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_upstream_error_status_passed_through() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("GET"))
            .and(matchers::path("/v1beta/models"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(serde_json::json!({"error": "Not Found"})),
            )
            .mount(&mock_server)
            .await;

        let request = Request::builder()
            .uri("/v1beta/models")
            .body(Body::empty())
            .unwrap();

        let response = test_router(test_config(&mock_server.uri(), 5))
            .oneshot(request)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_string(response).await.contains("Not Found"));
    }

    #[tokio::test]
    async fn test_group_query_param_routes_and_is_removed() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("GET"))
            .and(matchers::path("/alpha/v1beta/models"))
            .and(matchers::query_param("pageSize", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let request = Request::builder()
            .uri("/v1beta/models?group=alpha&pageSize=10")
            .body(Body::empty())
            .unwrap();

        let response = test_router(test_config(&mock_server.uri(), 5))
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let received = mock_server.received_requests().await.unwrap();
        assert_eq!(received[0].url.query(), Some("pageSize=10"));
    }

    #[tokio::test]
    async fn test_oversized_body_rejected_before_upstream() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let mut config = test_config(&mock_server.uri(), 5);
        config.proxy.max_body_bytes = 16;
        let body = chat_request().to_string();

        let request = Request::builder()
            .method("POST")
            .uri(UNARY_PATH)
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap();

        let response = test_router(config).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["error"]["type"], "request_error");
    }

    #[tokio::test]
    async fn test_unknown_group_rejected_before_upstream() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let request = Request::builder()
            .uri("/v1beta/models?group=zeta")
            .body(Body::empty())
            .unwrap();

        let response = test_router(test_config(&mock_server.uri(), 5))
            .oneshot(request)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["error"]["type"], "routing_error");
    }
}

// =============================================================================
// Streaming Relay Tests
// =============================================================================

mod streaming_tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_stream_relayed_verbatim() {
        let mock_server = MockServer::start().await;
        let lines = vec![text_line("Once"), text_finish_line(" upon a time", "STOP")];

        Mock::given(matchers::method("POST"))
            .and(matchers::path(STREAM_PATH))
            .and(matchers::query_param("alt", "sse"))
            .respond_with(sse_response(&lines))
            .expect(1)
            .mount(&mock_server)
            .await;

        let response = test_router(test_config(&mock_server.uri(), 5))
            .oneshot(stream_request(&format!("{STREAM_PATH}?alt=sse")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(body_string(response).await, sse_body(&lines));
    }

    #[tokio::test]
    async fn test_interrupted_stream_resumed_with_continuation() {
        let mock_server = MockServer::start().await;
        let first = vec![text_line("Hello"), finish_line("SAFETY")];
        let second = vec![text_finish_line(", world", "STOP")];

        Mock::given(matchers::method("POST"))
            .and(matchers::path(STREAM_PATH))
            .respond_with(sse_response(&first))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&mock_server)
            .await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path(STREAM_PATH))
            .and(matchers::body_string_contains("Hello"))
            .respond_with(sse_response(&second))
            .with_priority(2)
            .mount(&mock_server)
            .await;

        let response = test_router(test_config(&mock_server.uri(), 5))
            .oneshot(stream_request(STREAM_PATH))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        let expected: Vec<String> = first.iter().chain(second.iter()).cloned().collect();
        assert_eq!(body, sse_body(&expected));

        let received = mock_server.received_requests().await.unwrap();
        assert_eq!(received.len(), 2);

        let original: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(original, chat_request());

        let resumed: serde_json::Value = serde_json::from_slice(&received[1].body).unwrap();
        let contents = resumed["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["text"], "Hello");
        assert_eq!(contents[2]["parts"][0]["text"], CONTINUATION_PROMPT);
        assert_eq!(resumed["generationConfig"]["temperature"], 0.7);
    }

    #[tokio::test]
    async fn test_exhausted_budget_reports_error_event() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path(STREAM_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(3)
            .mount(&mock_server)
            .await;

        let response = test_router(test_config(&mock_server.uri(), 2))
            .oneshot(stream_request(STREAM_PATH))
            .await
            .unwrap();

        // Headers are committed before the first attempt
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_string(response).await;
        let records: Vec<&str> = body.split("\n\n").filter(|r| !r.is_empty()).collect();
        assert_eq!(records.len(), 1);

        let event: serde_json::Value =
            serde_json::from_str(records[0].trim_start_matches("data: ")).unwrap();
        assert_eq!(
            event["error"]["message"],
            "Stream interrupted and retry budget exhausted"
        );
        assert_eq!(event["error"]["group"], "default");
    }

    #[tokio::test]
    async fn test_stream_credentials_cleaned_for_group() {
        let mock_server = MockServer::start().await;
        let lines = vec![text_finish_line("ok", "STOP")];

        Mock::given(matchers::method("POST"))
            .and(matchers::path(format!("/alpha{STREAM_PATH}")))
            .and(matchers::query_param("key", "k123"))
            .respond_with(sse_response(&lines))
            .expect(1)
            .mount(&mock_server)
            .await;

        let request = Request::builder()
            .method("POST")
            .uri(format!("{STREAM_PATH}?alt=sse&key=alpha:k123"))
            .body(Body::from(chat_request().to_string()))
            .unwrap();

        let response = test_router(test_config(&mock_server.uri(), 5))
            .oneshot(request)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, sse_body(&lines));
    }

    #[tokio::test]
    async fn test_oversized_stream_body_is_stream_error() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let mut config = test_config(&mock_server.uri(), 5);
        config.proxy.max_body_bytes = 16;
        let body = chat_request().to_string();

        let request = Request::builder()
            .method("POST")
            .uri(STREAM_PATH)
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap();

        let response = test_router(config).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        let body = body_string(response).await;
        assert!(body.starts_with("data: "));
        assert!(body.contains("exceeds the 16 byte limit"));
    }

    #[tokio::test]
    async fn test_non_object_body_rejected_without_upstream_call() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let request = Request::builder()
            .method("POST")
            .uri(STREAM_PATH)
            .body(Body::from("[1, 2, 3]"))
            .unwrap();

        let response = test_router(test_config(&mock_server.uri(), 5))
            .oneshot(request)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_string(response).await;
        assert!(body.starts_with("data: "));
        assert!(body.contains("must be a JSON object"));
    }
}

// =============================================================================
// Slow Upstream Tests
// =============================================================================

mod slow_upstream_tests {
    use super::*;

    /// Serve every connection with `lines` as a close-delimited event stream,
    /// pausing between lines. Returns the base URL and a connection counter.
    async fn spawn_slow_upstream(pause: Duration, lines: Vec<String>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let lines = lines.clone();
                tokio::spawn(async move {
                    read_request(&mut socket).await;
                    let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
                    if socket.write_all(head.as_bytes()).await.is_err() {
                        return;
                    }
                    for (i, line) in lines.iter().enumerate() {
                        if i > 0 {
                            tokio::time::sleep(pause).await;
                        }
                        if socket.write_all(format!("{line}\n\n").as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    let _ = socket.shutdown().await;
                });
            }
        });

        (format!("http://{addr}"), connections)
    }

    /// Consume one request head plus its declared body.
    async fn read_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);

            if let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
                let length = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= head_end + 4 + length {
                    return;
                }
            }
        }
    }

    fn slow_config(upstream: &str, max_failures: u32) -> Config {
        let mut config = test_config(upstream, max_failures);
        config.proxy.read_timeout_secs = 1;
        config
    }

    #[tokio::test]
    async fn test_stream_longer_than_read_timeout_completes_in_one_attempt() {
        let lines = vec![
            text_line("slow "),
            text_line("but "),
            text_finish_line("steady", "STOP"),
        ];
        let (upstream, connections) =
            spawn_slow_upstream(Duration::from_millis(700), lines.clone()).await;

        let response = test_router(slow_config(&upstream, 5))
            .oneshot(stream_request(STREAM_PATH))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, sse_body(&lines));
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_unary_response_not_truncated() {
        let lines = vec![text_line("part one"), text_line("part two"), text_line("end")];
        let (upstream, connections) =
            spawn_slow_upstream(Duration::from_millis(700), lines.clone()).await;

        let request = Request::builder()
            .uri("/v1beta/models")
            .body(Body::empty())
            .unwrap();

        let response = test_router(slow_config(&upstream, 5))
            .oneshot(request)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, sse_body(&lines));
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stalled_stream_cut_by_read_timeout() {
        let lines = vec![text_line("stuck"), text_finish_line(" never", "STOP")];
        let (upstream, connections) =
            spawn_slow_upstream(Duration::from_secs(3), lines.clone()).await;

        let response = test_router(slow_config(&upstream, 0))
            .oneshot(stream_request(STREAM_PATH))
            .await
            .unwrap();

        let body = body_string(response).await;
        let records: Vec<&str> = body.split("\n\n").filter(|r| !r.is_empty()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], lines[0]);
        assert!(records[1].contains("retry budget exhausted"));
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }
}
