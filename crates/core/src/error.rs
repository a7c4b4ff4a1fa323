//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("digest algorithm mismatch: expected {expected}, got {actual}")]
    AlgorithmMismatch { expected: String, actual: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid configuration: {field}: {message}")]
    Config { field: String, message: String },

    #[error("upload session error: {0}")]
    UploadSession(String),
}

impl Error {
    /// Build a configuration error naming the offending field.
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
