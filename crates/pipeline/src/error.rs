//! Pipeline error types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tarlift_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the archive, upload and verification stages.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Config(String),

    #[error("source unreadable: {}: {source}", .path.display())]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive error: {0}")]
    Archive(#[source] std::io::Error),

    #[error("storage target unavailable after {attempts} attempt(s): {source}")]
    TargetUnavailable {
        attempts: u32,
        #[source]
        source: StorageError,
    },

    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Storage {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: StorageError,
    },

    #[error("upload of part {part_number} failed after {attempts} attempt(s): {source}")]
    UploadFailed {
        part_number: u32,
        attempts: u32,
        #[source]
        source: StorageError,
    },

    #[error("archive needs more than {limit} parts; increase the part size")]
    PartLimitExceeded { limit: u32 },

    #[error("commit failed after {attempts} attempt(s): {source}")]
    CommitFailed {
        attempts: u32,
        #[source]
        source: StorageError,
    },

    #[error("verification mismatch: local {local}, remote {remote}{}", format_parts(.discrepancy_segments))]
    VerificationMismatch {
        local: String,
        remote: String,
        discrepancy_segments: Vec<u32>,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("invalid state: {0}")]
    InvalidState(#[from] tarlift_core::Error),
}

fn format_parts(parts: &[u32]) -> String {
    if parts.is_empty() {
        return String::new();
    }
    let list: Vec<String> = parts.iter().map(u32::to_string).collect();
    format!(" (mismatching parts: {})", list.join(", "))
}

/// Coarse failure category carried by the report and mapped to exit codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Config,
    SourceUnreadable,
    Archive,
    UploadFailed,
    CommitFailed,
    VerificationMismatch,
    Cancelled,
    Internal,
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Config(_) | Self::TargetUnavailable { .. } => FailureKind::Config,
            Self::SourceUnreadable { .. } => FailureKind::SourceUnreadable,
            Self::Archive(_) => FailureKind::Archive,
            Self::Storage { .. } | Self::UploadFailed { .. } | Self::PartLimitExceeded { .. } => {
                FailureKind::UploadFailed
            }
            Self::CommitFailed { .. } => FailureKind::CommitFailed,
            Self::VerificationMismatch { .. } => FailureKind::VerificationMismatch,
            Self::Cancelled => FailureKind::Cancelled,
            Self::InvalidState(tarlift_core::Error::Config { .. }) => FailureKind::Config,
            Self::InvalidState(_) => FailureKind::Internal,
        }
    }
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
