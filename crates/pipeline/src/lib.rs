//! Streaming archive-and-upload pipeline.
//!
//! This crate provides:
//! - `ArchiveBuilder`: deterministic tar (optionally compressed) of a directory
//!   tree, streamed in bounded memory with the digest computed in the same pass
//! - `ChunkedUploader`: single-shot or multipart upload with bounded
//!   concurrency, per-part retry, abort on failure and optional resume
//! - `IntegrityVerifier`: whole or composite digest reconciliation after commit
//! - `Pipeline`: the state machine tying these together into one report

pub mod archive;
pub mod compression;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod resume;
pub mod retry;
pub mod uploader;
pub mod verify;

pub use archive::{ArchiveBuilder, ArchiveStream, ArchiveSummary};
pub use compression::CompressionKind;
pub use error::{FailureKind, PipelineError, PipelineResult};
pub use orchestrator::{Failure, Pipeline, PipelineReport, PipelineState};
pub use progress::{ProgressEvent, ProgressSink, SkippedEntry};
pub use resume::{ResumePart, ResumeRecord, ResumeStore};
pub use retry::{RetryError, RetryPolicy, with_backoff};
pub use uploader::ChunkedUploader;
pub use verify::IntegrityVerifier;
