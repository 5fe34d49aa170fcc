//! Test utilities for tether - scripted upstreams and a recording sleeper
//!
//! These doubles let the relay engine run deterministically:
//! - [`ScriptedTransport`] replays canned upstream responses in order
//! - [`RecordingSleeper`] records retry delays without waiting

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::proxy::ProxyError;
use crate::relay::{Sleeper, UpstreamResponse, UpstreamTransport};

/// One canned upstream reply
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Response head plus body chunks; an `Err` chunk breaks the stream
    Stream {
        status: StatusCode,
        chunks: Vec<Result<Bytes, ProxyError>>,
    },
    /// The call fails before any response arrives
    Fail(ProxyError),
}

impl ScriptedResponse {
    /// 200 response with each line sent as its own chunk
    pub fn lines(lines: &[&str]) -> Self {
        ScriptedResponse::Stream {
            status: StatusCode::OK,
            chunks: lines
                .iter()
                .map(|line| Ok(Bytes::from(format!("{line}\n"))))
                .collect(),
        }
    }

    /// 200 response with explicit raw chunks
    pub fn chunks(chunks: &[&[u8]]) -> Self {
        ScriptedResponse::Stream {
            status: StatusCode::OK,
            chunks: chunks
                .iter()
                .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
                .collect(),
        }
    }

    /// 200 response with no body at all
    pub fn empty() -> Self {
        Self::lines(&[])
    }

    /// Non-success status with an empty body
    pub fn status(status: StatusCode) -> Self {
        ScriptedResponse::Stream {
            status,
            chunks: Vec::new(),
        }
    }

    /// Connection-level failure
    pub fn network_error(message: &str) -> Self {
        ScriptedResponse::Fail(ProxyError::Network(message.to_string()))
    }

    /// 200 response whose body breaks after the given lines
    pub fn broken(lines: &[&str], message: &str) -> Self {
        let mut chunks: Vec<Result<Bytes, ProxyError>> = lines
            .iter()
            .map(|line| Ok(Bytes::from(format!("{line}\n"))))
            .collect();
        chunks.push(Err(ProxyError::Network(message.to_string())));
        ScriptedResponse::Stream {
            status: StatusCode::OK,
            chunks,
        }
    }
}

/// Transport that replays [`ScriptedResponse`]s and records request bodies.
///
/// Once the script runs out, every further call gets the fallback response
/// (an empty 200 body unless set with [`ScriptedTransport::with_fallback`]).
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<ScriptedResponse>>,
    fallback: ScriptedResponse,
    requests: Mutex<Vec<Value>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<ScriptedResponse>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: ScriptedResponse::empty(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, fallback: ScriptedResponse) -> Self {
        self.fallback = fallback;
        self
    }

    /// Request bodies received so far, parsed as JSON
    pub async fn requests(&self) -> Vec<Value> {
        self.requests.lock().await.clone()
    }

    pub async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl UpstreamTransport for ScriptedTransport {
    async fn open(&self, body: Bytes) -> Result<UpstreamResponse, ProxyError> {
        self.requests
            .lock()
            .await
            .push(serde_json::from_slice(&body).unwrap_or(Value::Null));

        let next = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match next {
            ScriptedResponse::Stream { status, chunks } => Ok(UpstreamResponse {
                status,
                body: stream::iter(chunks).boxed(),
            }),
            ScriptedResponse::Fail(err) => Err(err),
        }
    }
}

/// Sleeper that returns immediately and remembers every requested delay
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().await.clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().await.push(duration);
    }
}

/// A `data:` line carrying one text fragment
pub fn text_line(text: &str) -> String {
    let payload = serde_json::json!({
        "candidates": [{"content": {"parts": [{"text": text}], "role": "model"}}]
    });
    format!("data: {payload}")
}

/// A `data:` line carrying only a finish reason
pub fn finish_line(reason: &str) -> String {
    let payload = serde_json::json!({"candidates": [{"finishReason": reason}]});
    format!("data: {payload}")
}

/// A `data:` line carrying a final text fragment and a finish reason
pub fn text_finish_line(text: &str, reason: &str) -> String {
    let payload = serde_json::json!({
        "candidates": [{
            "content": {"parts": [{"text": text}], "role": "model"},
            "finishReason": reason
        }]
    });
    format!("data: {payload}")
}
