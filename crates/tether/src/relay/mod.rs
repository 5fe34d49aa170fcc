//! Stream relay with transparent resumption
//!
//! Framing, event interpretation, continuation payloads and the retry engine
//! that ties them together for streaming requests.

pub mod budget;
pub mod continuation;
pub mod engine;
pub mod events;
pub mod framer;
pub mod transport;

pub use budget::RetryBudget;
pub use continuation::{CONTINUATION_PROMPT, RequestPayload};
pub use engine::{
    Interruption, RECORD_SEPARATOR, RelayConfig, RelayEngine, RelayOutcome, RelayReport, Sleeper,
    TokioSleeper,
};
pub use events::{FinishReason, extract_finish_reason, extract_text};
pub use framer::{LineFramer, LineStream};
pub use transport::{ByteStream, HttpTransport, UpstreamResponse, UpstreamTransport};
