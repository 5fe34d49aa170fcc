//! Tether - stream-resilient reverse proxy for streaming generation APIs
//!
//! Routes requests to configured upstream groups and, for streaming calls,
//! resumes interrupted responses by asking the upstream to continue from
//! the text already delivered.

pub mod config;
pub mod error;
pub mod proxy;
pub mod relay;
pub mod testing;

pub use error::TetherError;
