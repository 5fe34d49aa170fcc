//! Error types for Tether

use thiserror::Error;

/// Main error type for Tether operations
#[derive(Error, Debug)]
pub enum TetherError {
    /// Configuration errors (file, environment, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Proxy/HTTP server errors
    #[error("Proxy error: {0}")]
    Proxy(String),
}

/// Result type alias for Tether operations
pub type Result<T> = std::result::Result<T, TetherError>;
