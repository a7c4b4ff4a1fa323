//! Pipeline orchestration: archive, upload, verify, report.

use crate::archive::{ArchiveBuilder, ArchiveSummary};
use crate::compression::CompressionKind;
use crate::error::{FailureKind, PipelineError, PipelineResult};
use crate::progress::{ProgressEvent, ProgressSink, SkippedEntry};
use crate::resume::{DEFAULT_STATE_DIR, ResumeStore};
use crate::retry::{RetryPolicy, with_backoff};
use crate::uploader::ChunkedUploader;
use crate::verify::IntegrityVerifier;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tarlift_core::config::AppConfig;
use tarlift_core::upload::{UploadId, UploadMode, UploadSession, UploadState, VerificationResult};
use tarlift_storage::{ObjectStore, PutOptions};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Pipeline lifecycle. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Archiving,
    Uploading,
    Verifying,
    Succeeded,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether `next` may follow `self`.
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed => true,
            Self::Succeeded => *self == Self::Verifying,
            _ => next > *self,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Archiving => "archiving",
            Self::Uploading => "uploading",
            Self::Verifying => "verifying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Cause of a failed run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

/// Final structured outcome of one run.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineReport {
    pub session_id: UploadId,
    pub source: PathBuf,
    pub key: String,
    pub status: PipelineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub elapsed_ms: u64,
    pub bytes_transferred: u64,
    pub archive_size: Option<u64>,
    pub entries: Option<u64>,
    pub skipped: Vec<SkippedEntry>,
    pub compression: CompressionKind,
    pub upload_mode: Option<UploadMode>,
    pub part_count: usize,
    pub local_digest: Option<String>,
    pub remote_digest: Option<String>,
    /// Composite digest derived from the part digests, for multipart objects.
    pub derived_digest: Option<String>,
    pub mismatching_parts: Vec<u32>,
    /// Multipart upload left open for a later run to resume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumable_upload_id: Option<String>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.status == PipelineState::Succeeded
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    fn record_archive(&mut self, summary: &ArchiveSummary) {
        self.archive_size = Some(summary.size);
        self.entries = Some(summary.entries);
        self.skipped = summary.skipped.clone();
        self.local_digest = Some(summary.digest.to_hex());
    }

    fn record_verification(&mut self, result: &VerificationResult) {
        self.remote_digest = Some(result.remote_digest.to_string());
        self.derived_digest = result.derived_digest.as_ref().map(ToString::to_string);
        self.mismatching_parts = result.discrepancy_segments.iter().copied().collect();
    }
}

/// One archive-and-upload run against one object key.
pub struct Pipeline {
    config: AppConfig,
    store: Arc<dyn ObjectStore>,
    cancel: CancellationToken,
    progress: ProgressSink,
    resume: Option<ResumeStore>,
    state: PipelineState,
}

impl Pipeline {
    /// Validate the configuration and prepare a run. No I/O happens here.
    pub fn new(config: AppConfig, store: Arc<dyn ObjectStore>) -> PipelineResult<Self> {
        config
            .validate()
            .map_err(|e| PipelineError::Config(e.to_string()))?;

        let resume = config.resume.enabled.then(|| {
            ResumeStore::new(
                config
                    .resume
                    .state_dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR)),
            )
        });

        Ok(Self {
            config,
            store,
            cancel: CancellationToken::new(),
            progress: ProgressSink::disabled(),
            resume,
            state: PipelineState::Idle,
        })
    }

    /// Token that cancels this run when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    /// Override where resume records live (implies resume is enabled).
    pub fn with_resume_store(mut self, store: ResumeStore) -> Self {
        self.resume = Some(store);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Archive `source`, upload it to `key`, verify it and report.
    #[instrument(skip(self), fields(backend = self.store.backend_name()))]
    pub async fn run(mut self, source: &Path, key: &str) -> PipelineReport {
        let started = Instant::now();
        let compression = CompressionKind::resolve(self.config.archive.compression, Path::new(key));
        let mut session = UploadSession::new(key, self.config.upload.part_size);
        let mut report = PipelineReport {
            session_id: session.id,
            source: source.to_path_buf(),
            key: self.config.storage.object_key(key),
            status: self.state,
            failure: None,
            started_at: OffsetDateTime::now_utc(),
            elapsed_ms: 0,
            bytes_transferred: 0,
            archive_size: None,
            entries: None,
            skipped: Vec::new(),
            compression,
            upload_mode: None,
            part_count: 0,
            local_digest: None,
            remote_digest: None,
            derived_digest: None,
            mismatching_parts: Vec::new(),
            resumable_upload_id: None,
        };

        info!(source = %source.display(), key = %report.key, %compression, "Starting pipeline");
        let result = self
            .execute(source, key, compression, &mut session, &mut report)
            .await;

        report.session_id = session.id;
        report.bytes_transferred = session.bytes_transferred;
        report.upload_mode = session.mode;
        report.part_count = session.part_count();
        if self.resume.is_some() && session.state == UploadState::InProgress {
            report.resumable_upload_id = session.multipart_id.clone();
        }

        match result {
            Ok(()) => {
                self.finish(PipelineState::Succeeded, &mut report);
                info!(
                    key = %report.key,
                    bytes = report.bytes_transferred,
                    parts = report.part_count,
                    "Pipeline succeeded"
                );
            }
            Err(err) => {
                let err = if self.cancel.is_cancelled() && matches!(err, PipelineError::Archive(_)) {
                    PipelineError::Cancelled
                } else {
                    err
                };
                if let PipelineError::VerificationMismatch {
                    discrepancy_segments,
                    ..
                } = &err
                {
                    report.mismatching_parts = discrepancy_segments.clone();
                }
                error!(key = %report.key, error = %err, "Pipeline failed");
                report.failure = Some(Failure {
                    kind: err.kind(),
                    message: err.to_string(),
                });
                self.finish(PipelineState::Failed, &mut report);
            }
        }
        report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        report
    }

    async fn execute(
        &mut self,
        source: &Path,
        key: &str,
        compression: CompressionKind,
        session: &mut UploadSession,
        report: &mut PipelineReport,
    ) -> PipelineResult<()> {
        self.transition(PipelineState::Archiving)?;
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let mut stream = ArchiveBuilder::new(source)
            .compression(compression)
            .digest_algorithm(self.store.digest_algorithm())
            .chunk_size(self.config.archive.chunk_size)
            .queue_depth(self.config.upload.queue_depth)
            .progress(self.progress.clone())
            .cancellation(self.cancel.clone())
            .build()
            .await?;
        self.check_target().await?;

        self.transition(PipelineState::Uploading)?;
        let uploader = ChunkedUploader::new(self.store.clone(), &self.config.upload)
            .options(PutOptions {
                storage_class: self.config.storage.storage_class,
                content_type: Some(compression.content_type().to_string()),
            })
            .progress(self.progress.clone())
            .cancellation(self.cancel.clone())
            .resume_store(self.resume.clone());
        uploader.upload_into(&mut stream, session).await?;

        let summary = stream.finish()?;
        report.record_archive(&summary);

        self.transition(PipelineState::Verifying)?;
        let verification = IntegrityVerifier::new(
            self.store.clone(),
            RetryPolicy::from_config(&self.config.upload),
        )
        .cancellation(self.cancel.clone())
        .verify(&summary.digest, summary.size, session)
        .await?;
        report.record_verification(&verification);

        if !verification.matches {
            return Err(PipelineError::VerificationMismatch {
                local: verification
                    .derived_digest
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| summary.digest.to_hex()),
                remote: verification.remote_digest.to_string(),
                discrepancy_segments: verification.discrepancy_segments.into_iter().collect(),
            });
        }
        Ok(())
    }

    /// Confirm the store is reachable before any upload state is created.
    async fn check_target(&self) -> PipelineResult<()> {
        with_backoff(
            &RetryPolicy::from_config(&self.config.upload),
            &self.cancel,
            || self.store.health_check(),
            |attempt, err, _| warn!(attempt, error = %err, "Health check failed, retrying"),
        )
        .await
        .map_err(|err| match err.into_parts() {
            Some((attempts, source)) => PipelineError::TargetUnavailable { attempts, source },
            None => PipelineError::Cancelled,
        })
    }

    fn transition(&mut self, next: PipelineState) -> PipelineResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(tarlift_core::Error::InvalidState(format!(
                "pipeline cannot move from {} to {next}",
                self.state
            ))
            .into());
        }
        debug!(from = %self.state, to = %next, "Pipeline state change");
        self.progress.emit(ProgressEvent::StateChanged {
            from: self.state,
            to: next,
        });
        self.state = next;
        Ok(())
    }

    fn finish(&mut self, terminal: PipelineState, report: &mut PipelineReport) {
        if let Err(err) = self.transition(terminal) {
            debug!(error = %err, "Pipeline already finished");
        }
        report.status = self.state;
    }
}
