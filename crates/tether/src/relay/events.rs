//! Per-line interpretation of the upstream event protocol
//!
//! Upstream records look like:
//! ```text
//! data: {"candidates":[{"content":{"parts":[{"text":"Hello"}],"role":"model"}}]}
//!
//! data: {"candidates":[{"content":{"parts":[{"text":"!"}]},"finishReason":"STOP"}]}
//! ```
//! Both extractors return `None` for anything they cannot read. A missing
//! finish reason is how interruptions are detected, so parse failures must
//! never surface as errors here.

use serde_json::Value;
use std::fmt;

const DATA_PREFIX: &str = "data:";
const FINISH_REASON_FIELD: &str = "finishReason";

/// Why the upstream stopped generating
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural end of the response
    Stop,
    /// Output token limit reached
    MaxTokens,
    /// Anything else (`SAFETY`, `RECITATION`, `OTHER`, ...)
    Other(String),
}

impl FinishReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "STOP" => FinishReason::Stop,
            "MAX_TOKENS" => FinishReason::MaxTokens,
            other => FinishReason::Other(other.to_string()),
        }
    }

    /// Whether this reason ends the response normally
    pub fn is_complete(&self) -> bool {
        matches!(self, FinishReason::Stop | FinishReason::MaxTokens)
    }

    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "STOP",
            FinishReason::MaxTokens => "MAX_TOKENS",
            FinishReason::Other(raw) => raw,
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extract the text fragment carried by a `data:` line.
///
/// Returns the first candidate's first part text when it is present and
/// non-empty.
pub fn extract_text(line: &str) -> Option<String> {
    let payload = line.strip_prefix(DATA_PREFIX)?.trim_start();
    let value: Value = serde_json::from_str(payload).ok()?;

    let text = value
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("text")?
        .as_str()?;

    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Extract the finish reason from any line that mentions one.
///
/// Not restricted to `data:` lines: parsing starts at the first `{` so that
/// lines re-framed by intermediaries are still understood. Bytes after the
/// first JSON document are ignored.
pub fn extract_finish_reason(line: &str) -> Option<FinishReason> {
    if !line.contains(FINISH_REASON_FIELD) {
        return None;
    }

    let start = line.find('{')?;
    let value = serde_json::Deserializer::from_str(&line[start..])
        .into_iter::<Value>()
        .next()?
        .ok()?;

    let raw = value
        .get("candidates")?
        .get(0)?
        .get(FINISH_REASON_FIELD)?
        .as_str()?;

    Some(FinishReason::parse(raw))
}
