//! Error types for `WebPier` core library.

use thiserror::Error;

/// Result type alias using `WebPier` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `WebPier` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed control message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// File lock error
    #[error("Lock error: {0}")]
    Lock(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
