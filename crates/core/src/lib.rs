//! Core domain types for the tarlift archive-and-upload pipeline.
//!
//! This crate defines the data model shared by the storage client, the
//! pipeline and the CLI:
//! - Streaming digests, composite (multipart) digests and remote ETags
//! - Upload parts, upload sessions and verification results
//! - Configuration and validation

pub mod config;
pub mod error;
pub mod hash;
pub mod upload;

pub use config::{
    AppConfig, ArchiveConfig, CompressionConfig, ResumeConfig, StorageClass, StorageConfig,
    UploadConfig,
};
pub use error::{Error, Result};
pub use hash::{CompositeDigest, Digest, DigestAccumulator, DigestAlgorithm, RemoteDigest};
pub use upload::{
    ByteRange, UploadId, UploadMode, UploadPart, UploadSession, UploadState, VerificationResult,
};

/// Default part size: 8 MiB
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

/// Maximum part size: 1 GiB
pub const MAX_PART_SIZE: u64 = 1024 * 1024 * 1024;

/// Minimum part size: 5 MiB (smallest non-final part S3 accepts)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum number of parts in one multipart upload.
pub const MAX_PARTS: u32 = 10_000;
