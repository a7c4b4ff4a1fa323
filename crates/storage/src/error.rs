//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("no such multipart upload: {0}")]
    NoSuchUpload(String),

    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid part: {0}")]
    InvalidPart(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Rejected { status, .. } => is_transient_status(*status),
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// 5xx responses, 408 and 429 are worth retrying.
pub fn is_transient_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::Transient("timeout".into()).is_transient());
        assert!(
            StorageError::Rejected {
                status: 503,
                message: "slow down".into()
            }
            .is_transient()
        );
        assert!(
            StorageError::Rejected {
                status: 429,
                message: "too many requests".into()
            }
            .is_transient()
        );
        assert!(
            !StorageError::Rejected {
                status: 403,
                message: "access denied".into()
            }
            .is_transient()
        );
        assert!(
            StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset"
            ))
            .is_transient()
        );
        assert!(!StorageError::NotFound("key".into()).is_transient());
        assert!(!StorageError::NoSuchUpload("id".into()).is_transient());
        assert!(!StorageError::Config("bad".into()).is_transient());
    }
}
