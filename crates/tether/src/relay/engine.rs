//! Relay-retry engine
//!
//! Drives one streaming request to completion. Each attempt's lines are
//! forwarded to the client as they arrive; when an attempt ends without a
//! normal finish reason the engine asks the upstream to continue from the
//! text accumulated so far, until it completes or the failure budget runs
//! out.
//!
//! ```text
//! Attempting -> Streaming -> Evaluating -> Done
//!      ^                          |
//!      |                          v
//!      +---------------------- Retrying -> Failed
//! ```

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::budget::RetryBudget;
use super::continuation::RequestPayload;
use super::events::{FinishReason, extract_finish_reason, extract_text};
use super::framer::LineStream;
use super::transport::{ByteStream, UpstreamTransport};
use crate::config::RetryConfig;
use crate::proxy::{ProxyError, StreamErrorEvent};

/// Framing appended to every forwarded line
pub const RECORD_SEPARATOR: &str = "\n\n";

const EXHAUSTED_MESSAGE: &str = "Stream interrupted and retry budget exhausted";
const INTERNAL_MESSAGE: &str = "Internal proxy error while relaying stream";

/// Injected delay between attempts
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[async_trait]
impl<S: Sleeper + ?Sized> Sleeper for Arc<S> {
    async fn sleep(&self, duration: Duration) {
        (**self).sleep(duration).await
    }
}

/// Real-time sleeper used in production
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Per-request engine settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_consecutive_failures: u32,
    pub retry_delay: Duration,
    /// Group name echoed in error events
    pub group: Option<String>,
}

impl RelayConfig {
    pub fn from_retry(retry: &RetryConfig, group: Option<String>) -> Self {
        Self {
            max_consecutive_failures: retry.max_consecutive_failures,
            retry_delay: retry.retry_delay(),
            group,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_retry(&RetryConfig::default(), None)
    }
}

/// How a relay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Upstream reported a normal finish
    Completed,
    /// Failure budget ran out; an error event was written
    Exhausted,
    /// The client went away
    ClientDisconnected,
    /// Internal failure; a best-effort error event was written
    Aborted,
}

/// Summary of a finished relay, for logging and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub outcome: RelayOutcome,
    pub attempts: u32,
    pub forwarded_lines: usize,
    pub accumulated_text: String,
    pub consecutive_failures: u32,
}

/// Why an attempt needs a retry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interruption {
    /// The call failed, or the body broke mid-stream
    Transport(String),
    /// Upstream answered with a non-success status
    Status(StatusCode),
    /// Upstream finished for an abnormal reason
    Abnormal(FinishReason),
    /// The stream ended without any finish reason
    MissingFinishReason,
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interruption::Transport(message) => write!(f, "transport failure: {message}"),
            Interruption::Status(status) => write!(f, "upstream returned {status}"),
            Interruption::Abnormal(reason) => write!(f, "finish reason {reason}"),
            Interruption::MissingFinishReason => f.write_str("stream ended without finish reason"),
        }
    }
}

/// What one attempt's stream produced
#[derive(Debug, Default)]
struct AttemptSummary {
    lines: usize,
    fragments: usize,
    finish_reason: Option<FinishReason>,
    transport_error: Option<String>,
}

enum RelayState {
    Attempting(RequestPayload),
    Streaming(ByteStream),
    Evaluating(AttemptSummary),
    Retrying(Interruption),
    Done,
    Failed(Interruption),
}

/// Conditions that end a relay early
enum RelayFault {
    ClientGone,
    Internal(String),
}

/// Runs the attempt loop for one client request.
///
/// The engine owns the only writer for the client stream; it is dropped when
/// [`RelayEngine::run`] returns, which closes the stream.
pub struct RelayEngine<T, S = TokioSleeper> {
    transport: T,
    sleeper: S,
    config: RelayConfig,
    original: RequestPayload,
    sink: mpsc::Sender<Bytes>,
    budget: RetryBudget,
    accumulated: String,
    attempts: u32,
    forwarded_lines: usize,
}

impl<T: UpstreamTransport> RelayEngine<T, TokioSleeper> {
    pub fn new(
        transport: T,
        config: RelayConfig,
        original: RequestPayload,
        sink: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            transport,
            sleeper: TokioSleeper,
            budget: RetryBudget::new(config.max_consecutive_failures),
            config,
            original,
            sink,
            accumulated: String::new(),
            attempts: 0,
            forwarded_lines: 0,
        }
    }
}

impl<T: UpstreamTransport, S: Sleeper> RelayEngine<T, S> {
    /// Replace the retry delay implementation
    pub fn with_sleeper<S2: Sleeper>(self, sleeper: S2) -> RelayEngine<T, S2> {
        RelayEngine {
            transport: self.transport,
            sleeper,
            config: self.config,
            original: self.original,
            sink: self.sink,
            budget: self.budget,
            accumulated: self.accumulated,
            attempts: self.attempts,
            forwarded_lines: self.forwarded_lines,
        }
    }

    /// Relay until completion, exhaustion, disconnect or internal failure.
    pub async fn run(mut self) -> RelayReport {
        let outcome = match self.drive().await {
            Ok(outcome) => outcome,
            Err(RelayFault::ClientGone) => {
                tracing::info!(attempts = self.attempts, "Client disconnected, abandoning relay");
                RelayOutcome::ClientDisconnected
            }
            Err(RelayFault::Internal(message)) => {
                tracing::error!(error = %message, "Relay failed internally");
                let event = StreamErrorEvent::new(INTERNAL_MESSAGE)
                    .with_details(message)
                    .with_group(self.config.group.clone());
                if self.emit(&event).await.is_err() {
                    tracing::debug!("Could not deliver internal error event");
                }
                RelayOutcome::Aborted
            }
        };

        RelayReport {
            outcome,
            attempts: self.attempts,
            forwarded_lines: self.forwarded_lines,
            accumulated_text: std::mem::take(&mut self.accumulated),
            consecutive_failures: self.budget.consecutive_failures(),
        }
    }

    async fn drive(&mut self) -> Result<RelayOutcome, RelayFault> {
        let mut state = RelayState::Attempting(self.original.clone());

        loop {
            state = match state {
                RelayState::Attempting(payload) => self.attempt(&payload).await?,
                RelayState::Streaming(body) => RelayState::Evaluating(self.stream(body).await?),
                RelayState::Evaluating(summary) => self.evaluate(summary),
                RelayState::Retrying(reason) => self.retry(reason).await?,
                RelayState::Done => return Ok(RelayOutcome::Completed),
                RelayState::Failed(reason) => {
                    self.exhausted(&reason).await?;
                    return Ok(RelayOutcome::Exhausted);
                }
            };
        }
    }

    async fn attempt(&mut self, payload: &RequestPayload) -> Result<RelayState, RelayFault> {
        self.attempts += 1;
        let body = payload
            .to_bytes()
            .map_err(|e| RelayFault::Internal(e.to_string()))?;

        tracing::info!(
            attempt = self.attempts,
            accumulated_chars = self.accumulated.chars().count(),
            "Opening upstream stream"
        );

        let opened = tokio::select! {
            biased;
            _ = self.sink.closed() => return Err(RelayFault::ClientGone),
            opened = self.transport.open(Bytes::from(body)) => opened,
        };

        match opened {
            Err(ProxyError::Internal(message)) => Err(RelayFault::Internal(message)),
            Err(e) => {
                tracing::warn!(attempt = self.attempts, error = %e, "Upstream request failed");
                Ok(RelayState::Retrying(Interruption::Transport(e.to_string())))
            }
            Ok(response) if !response.status.is_success() => {
                tracing::warn!(attempt = self.attempts, status = %response.status, "Upstream returned error status");
                Ok(RelayState::Retrying(Interruption::Status(response.status)))
            }
            Ok(response) => Ok(RelayState::Streaming(response.body)),
        }
    }

    /// Forward every line, then interpret it. The body is dropped on return.
    async fn stream(&mut self, body: ByteStream) -> Result<AttemptSummary, RelayFault> {
        let mut lines = LineStream::new(body);
        let mut summary = AttemptSummary::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.sink.closed() => return Err(RelayFault::ClientGone),
                next = lines.next() => next,
            };

            let line = match next {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    tracing::warn!(attempt = self.attempts, error = %e, "Upstream stream broke");
                    summary.transport_error = Some(e.to_string());
                    break;
                }
                None => break,
            };

            self.forward(Bytes::from(format!("{line}{RECORD_SEPARATOR}")))
                .await?;
            self.forwarded_lines += 1;
            summary.lines += 1;
            tracing::trace!(line = %line, "Forwarded line");

            if let Some(text) = extract_text(&line) {
                self.accumulated.push_str(&text);
                summary.fragments += 1;
            }
            if let Some(reason) = extract_finish_reason(&line) {
                tracing::debug!(finish_reason = %reason, "Finish reason seen");
                summary.finish_reason = Some(reason);
            }
        }

        Ok(summary)
    }

    fn evaluate(&mut self, summary: AttemptSummary) -> RelayState {
        tracing::debug!(
            attempt = self.attempts,
            lines = summary.lines,
            fragments = summary.fragments,
            "Attempt stream ended"
        );

        if summary.fragments > 0 {
            self.budget.record_progress();
        }

        match (summary.finish_reason, summary.transport_error) {
            (Some(reason), _) if reason.is_complete() => {
                tracing::info!(
                    attempt = self.attempts,
                    finish_reason = %reason,
                    "Upstream stream completed"
                );
                RelayState::Done
            }
            (_, Some(message)) => RelayState::Retrying(Interruption::Transport(message)),
            (Some(reason), None) => RelayState::Retrying(Interruption::Abnormal(reason)),
            (None, None) => RelayState::Retrying(Interruption::MissingFinishReason),
        }
    }

    /// Charge the budget, wait, and build the next attempt. With nothing
    /// accumulated yet the original request is resent, since a continuation
    /// would carry an empty model turn.
    async fn retry(&mut self, reason: Interruption) -> Result<RelayState, RelayFault> {
        self.budget.record_failure();
        if self.budget.is_exhausted() {
            return Ok(RelayState::Failed(reason));
        }

        tracing::warn!(
            attempt = self.attempts,
            consecutive_failures = self.budget.consecutive_failures(),
            max = self.budget.max(),
            reason = %reason,
            "Stream interrupted, retrying"
        );

        tokio::select! {
            biased;
            _ = self.sink.closed() => return Err(RelayFault::ClientGone),
            _ = self.sleeper.sleep(self.config.retry_delay) => {}
        }

        let payload = if self.accumulated.is_empty() {
            self.original.clone()
        } else {
            self.original.continuation(&self.accumulated)
        };
        Ok(RelayState::Attempting(payload))
    }

    async fn exhausted(&mut self, reason: &Interruption) -> Result<(), RelayFault> {
        tracing::error!(
            attempts = self.attempts,
            consecutive_failures = self.budget.consecutive_failures(),
            reason = %reason,
            "Retry budget exhausted"
        );

        let event = StreamErrorEvent::new(EXHAUSTED_MESSAGE)
            .with_details(format!(
                "{} consecutive failed attempts (max {}); last: {reason}",
                self.budget.consecutive_failures(),
                self.budget.max()
            ))
            .with_group(self.config.group.clone());
        self.emit(&event).await
    }

    async fn emit(&self, event: &StreamErrorEvent) -> Result<(), RelayFault> {
        let record = event
            .to_sse()
            .map_err(|e| RelayFault::Internal(format!("Failed to serialize error event: {e}")))?;
        self.forward(Bytes::from(record)).await
    }

    async fn forward(&self, record: Bytes) -> Result<(), RelayFault> {
        self.sink
            .send(record)
            .await
            .map_err(|_| RelayFault::ClientGone)
    }
}
