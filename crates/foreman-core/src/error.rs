//! Error types for Foreman core library.

use thiserror::Error;

/// Result type alias using Foreman [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Foreman operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A worker report line could not be interpreted.
    #[error("Failed to parse worker report: {0}")]
    ReportParse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
