//! Chunked uploader.
//!
//! Cuts the archive stream into parts, sends up to `concurrency` of them at
//! once with per-part retry, and commits the multipart upload once every part
//! is acknowledged. Archives that end within the first part go up in a single
//! request instead.

use crate::archive::ArchiveStream;
use crate::error::{PipelineError, PipelineResult};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::resume::{ResumePart, ResumeRecord, ResumeStore};
use crate::retry::{RetryError, RetryPolicy, with_backoff};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tarlift_core::MAX_PARTS;
use tarlift_core::config::UploadConfig;
use tarlift_core::hash::{Digest, DigestAlgorithm};
use tarlift_core::upload::{ByteRange, UploadMode, UploadPart, UploadSession, UploadState};
use tarlift_storage::{CompletedPart, MultipartId, ObjectStore, PutOptions, StorageError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Acknowledged parts between two resume record writes.
const CHECKPOINT_INTERVAL: usize = 16;

/// Uploads an archive stream to one object key.
#[derive(Clone)]
pub struct ChunkedUploader {
    store: Arc<dyn ObjectStore>,
    part_size: u64,
    concurrency: usize,
    retry: RetryPolicy,
    commit_retry: RetryPolicy,
    options: PutOptions,
    progress: ProgressSink,
    cancel: CancellationToken,
    resume: Option<ResumeStore>,
}

impl std::fmt::Debug for ChunkedUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedUploader")
            .field("backend", &self.store.backend_name())
            .field("part_size", &self.part_size)
            .field("concurrency", &self.concurrency)
            .field("retry", &self.retry)
            .field("resume", &self.resume)
            .finish_non_exhaustive()
    }
}

impl ChunkedUploader {
    pub fn new(store: Arc<dyn ObjectStore>, config: &UploadConfig) -> Self {
        Self {
            store,
            part_size: config.part_size,
            concurrency: config.concurrency.max(1),
            retry: RetryPolicy::from_config(config),
            commit_retry: RetryPolicy::for_commit(config),
            options: PutOptions::default(),
            progress: ProgressSink::disabled(),
            cancel: CancellationToken::new(),
            resume: None,
        }
    }

    pub fn options(mut self, options: PutOptions) -> Self {
        self.options = options;
        self
    }

    pub fn progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Keep interrupted multipart uploads open and record them here.
    pub fn resume_store(mut self, store: Option<ResumeStore>) -> Self {
        self.resume = store;
        self
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Upload the whole stream to `key` and return the committed session.
    pub async fn upload(
        &self,
        stream: &mut ArchiveStream,
        key: &str,
    ) -> PipelineResult<UploadSession> {
        let mut session = UploadSession::new(key, self.part_size);
        self.upload_into(stream, &mut session).await?;
        Ok(session)
    }

    /// Upload the whole stream into a pending session.
    ///
    /// On failure the session shows what happened: `Aborted` when the remote
    /// upload was discarded, still `InProgress` when it was kept for resume.
    #[instrument(skip_all, fields(key = %session.key, part_size = self.part_size, backend = self.store.backend_name()))]
    pub async fn upload_into(
        &self,
        stream: &mut ArchiveStream,
        session: &mut UploadSession,
    ) -> PipelineResult<()> {
        let part_size = usize::try_from(self.part_size)
            .map_err(|_| PipelineError::Config("part size exceeds platform limits".to_string()))?;
        let mut parts = PartReader::new(stream, part_size);

        let first = parts.next_part().await;
        let first = match first {
            Ok(first) => first,
            Err(err) => {
                self.discard(session).await;
                return Err(err);
            }
        };

        match first {
            None => self.single_shot(session, Bytes::new()).await,
            Some((data, true)) => self.single_shot(session, data).await,
            Some((data, false)) => self.multipart(session, &mut parts, data).await,
        }
    }

    async fn single_shot(&self, session: &mut UploadSession, data: Bytes) -> PipelineResult<()> {
        session.start(UploadMode::SingleShot, None)?;
        let digest = Digest::compute(self.part_algorithm(), &data);
        let size = data.len() as u64;
        debug!(size, "Uploading archive in a single request");

        let result = with_backoff(
            &self.retry,
            &self.cancel,
            || {
                self.store
                    .put(&session.key, data.clone(), &digest, &self.options)
            },
            |attempt, err, delay| self.report_retry(1, attempt, err, delay),
        )
        .await;

        let remote = match result {
            Ok(remote) => remote,
            Err(err) => {
                self.discard(session).await;
                return Err(part_error(1, err));
            }
        };

        session.record_part(UploadPart {
            part_number: 1,
            range: ByteRange::new(0, size),
            local_digest: digest,
            remote_etag: Some(remote.to_etag()),
        })?;
        session.bytes_transferred += size;
        self.progress.emit(ProgressEvent::PartUploaded {
            part_number: 1,
            size,
        });
        session.commit(remote)?;
        self.progress.emit(ProgressEvent::Committed {
            parts: 1,
            bytes: size,
        });
        info!(size, "Single-shot upload committed");
        Ok(())
    }

    async fn multipart(
        &self,
        session: &mut UploadSession,
        parts: &mut PartReader<'_>,
        first: Bytes,
    ) -> PipelineResult<()> {
        let (upload, reusable) = self.open_multipart(session).await?;
        session.start(UploadMode::Multipart, Some(upload.to_string()))?;
        info!(upload_id = %upload, reusable = reusable.len(), "Multipart upload opened");

        let result = self.send_parts(session, &upload, parts, first, &reusable).await;
        let result = match result {
            Ok(()) => self.commit(session, &upload).await,
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            let keep_open = self.resume.is_some()
                && matches!(
                    err,
                    PipelineError::Cancelled | PipelineError::UploadFailed { .. }
                );
            if keep_open {
                self.checkpoint(session).await;
                warn!(upload_id = %upload, error = %err, "Upload interrupted; kept open for resume");
            } else {
                self.discard(session).await;
            }
            return Err(err);
        }
        Ok(())
    }

    async fn send_parts(
        &self,
        session: &mut UploadSession,
        upload: &MultipartId,
        parts: &mut PartReader<'_>,
        first: Bytes,
        reusable: &BTreeMap<u32, ResumePart>,
    ) -> PipelineResult<()> {
        let mut in_flight = FuturesUnordered::new();
        let mut next = Some((first, false));
        let mut part_number = 0u32;
        let mut offset = 0u64;

        let outcome: PipelineResult<()> = async {
            while let Some((data, is_last)) = next.take() {
                if self.cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }
                part_number += 1;
                if part_number > MAX_PARTS {
                    return Err(PipelineError::PartLimitExceeded { limit: MAX_PARTS });
                }

                let size = data.len() as u64;
                let range = ByteRange::new(offset, size);
                offset += size;
                let digest = Digest::compute(self.part_algorithm(), &data);

                if let Some(previous) = reusable.get(&part_number)
                    && previous.digest == digest
                    && previous.size == size
                {
                    let part = UploadPart {
                        part_number,
                        range,
                        local_digest: digest,
                        remote_etag: Some(previous.etag.clone()),
                    };
                    self.acknowledge(session, part, true).await?;
                } else {
                    in_flight.push(self.send_part(
                        session.key.clone(),
                        upload.clone(),
                        part_number,
                        range,
                        data,
                        digest,
                    ));
                }

                if in_flight.len() >= self.concurrency
                    && let Some(result) = in_flight.next().await
                {
                    self.acknowledge(session, result?, false).await?;
                }

                if !is_last {
                    // Keep acknowledging parts while the next one is read.
                    let read = parts.next_part();
                    tokio::pin!(read);
                    next = loop {
                        tokio::select! {
                            Some(result) = in_flight.next() => {
                                self.acknowledge(session, result?, false).await?;
                            }
                            part = &mut read => break part?,
                        }
                    };
                }
            }

            while let Some(result) = in_flight.next().await {
                self.acknowledge(session, result?, false).await?;
            }
            Ok::<(), PipelineError>(())
        }
        .await;

        if outcome.is_err() {
            // Let requests already on the wire finish; keep what they stored.
            while let Some(result) = in_flight.next().await {
                match result {
                    Ok(part) => {
                        if let Err(err) = self.acknowledge(session, part, false).await {
                            debug!(error = %err, "Dropping late part acknowledgement");
                        }
                    }
                    Err(err) => debug!(error = %err, "In-flight part failed after the upload failed"),
                }
            }
        }
        outcome
    }

    async fn send_part(
        &self,
        key: String,
        upload: MultipartId,
        part_number: u32,
        range: ByteRange,
        data: Bytes,
        digest: Digest,
    ) -> PipelineResult<UploadPart> {
        let result = with_backoff(
            &self.retry,
            &self.cancel,
            || {
                self.store
                    .upload_part(&key, &upload, part_number, data.clone(), &digest)
            },
            |attempt, err, delay| self.report_retry(part_number, attempt, err, delay),
        )
        .await;

        let receipt = result.map_err(|err| part_error(part_number, err))?;
        debug!(part_number, size = range.len(), "Part uploaded");
        Ok(UploadPart {
            part_number,
            range,
            local_digest: digest,
            remote_etag: Some(receipt.etag),
        })
    }

    async fn acknowledge(
        &self,
        session: &mut UploadSession,
        part: UploadPart,
        reused: bool,
    ) -> PipelineResult<()> {
        let part_number = part.part_number;
        let size = part.range.len();
        session.record_part(part)?;

        if reused {
            self.progress
                .emit(ProgressEvent::PartReused { part_number, size });
        } else {
            session.bytes_transferred += size;
            self.progress
                .emit(ProgressEvent::PartUploaded { part_number, size });
        }
        if checkpoint_due(session.part_count()) {
            self.checkpoint(session).await;
        }
        Ok(())
    }

    async fn commit(&self, session: &mut UploadSession, upload: &MultipartId) -> PipelineResult<()> {
        let completed: Vec<CompletedPart> = session
            .completed_parts()
            .into_iter()
            .map(|(part_number, etag)| CompletedPart { part_number, etag })
            .collect();

        let result = with_backoff(
            &self.commit_retry,
            &self.cancel,
            || self.store.complete_multipart(&session.key, upload, &completed),
            |attempt, err, delay| {
                warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "Commit failed, retrying");
            },
        )
        .await;

        let remote = match result {
            Ok(remote) => remote,
            Err(err) => {
                return Err(match err.into_parts() {
                    Some((attempts, source)) => PipelineError::CommitFailed { attempts, source },
                    None => PipelineError::Cancelled,
                });
            }
        };

        session.commit(remote)?;
        self.forget(&session.key).await;
        self.progress.emit(ProgressEvent::Committed {
            parts: completed.len(),
            bytes: session.total_bytes(),
        });
        info!(
            parts = completed.len(),
            bytes = session.total_bytes(),
            transferred = session.bytes_transferred,
            "Multipart upload committed"
        );
        Ok(())
    }

    /// Reopen a recorded upload for this key, or create a fresh one.
    async fn open_multipart(
        &self,
        session: &mut UploadSession,
    ) -> PipelineResult<(MultipartId, BTreeMap<u32, ResumePart>)> {
        let target = self.store.target_id(&session.key);
        if let Some(record) = self.load_record(&target).await {
            let upload = MultipartId(record.multipart_id.clone());
            if record.part_size != self.part_size || record.algorithm != self.part_algorithm() {
                info!(upload_id = %upload, "Recorded upload used other settings; starting over");
                self.abort_remote(&session.key, &upload).await;
            } else {
                let listed = with_backoff(
                    &self.retry,
                    &self.cancel,
                    || self.store.list_parts(&session.key, &upload),
                    |_, _, _| {},
                )
                .await;
                match listed {
                    Ok(listed) => {
                        let reusable = record
                            .parts
                            .into_iter()
                            .filter(|part| {
                                listed.iter().any(|l| {
                                    l.part_number == part.part_number
                                        && l.etag.trim_matches('"') == part.etag.trim_matches('"')
                                })
                            })
                            .map(|part| (part.part_number, part))
                            .collect();
                        session.id = record.session_id;
                        return Ok((upload, reusable));
                    }
                    Err(RetryError::Cancelled) => return Err(PipelineError::Cancelled),
                    Err(err) => {
                        if let Some((_, source)) = err.into_parts() {
                            info!(upload_id = %upload, error = %source, "Recorded upload is gone; starting over");
                        }
                    }
                }
            }
            self.forget(&session.key).await;
        }

        let result = with_backoff(
            &self.retry,
            &self.cancel,
            || self.store.create_multipart(&session.key, &self.options),
            |attempt, err, delay| {
                warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "Opening upload failed, retrying");
            },
        )
        .await;

        match result {
            Ok(upload) => Ok((upload, BTreeMap::new())),
            Err(err) => {
                session.abort()?;
                Err(storage_error("create_multipart", err))
            }
        }
    }

    /// Abort whatever the session holds remotely and mark it aborted.
    async fn discard(&self, session: &mut UploadSession) {
        if let Some(id) = session.multipart_id.clone() {
            self.abort_remote(&session.key, &MultipartId(id)).await;
        }
        if session.state != UploadState::Aborted
            && let Err(err) = session.abort()
        {
            debug!(error = %err, "Session already terminal");
        }
        self.forget(&session.key).await;
    }

    async fn abort_remote(&self, key: &str, upload: &MultipartId) {
        // A cancelled run still has to clean up, so this ignores the run's token.
        let result = with_backoff(
            &self.retry,
            &CancellationToken::new(),
            || self.store.abort_multipart(key, upload),
            |_, _, _| {},
        )
        .await;
        match result {
            Ok(()) => info!(upload_id = %upload, "Multipart upload aborted"),
            Err(err) => {
                let message = err
                    .into_parts()
                    .map(|(_, source)| source.to_string())
                    .unwrap_or_default();
                warn!(upload_id = %upload, error = %message, "Failed to abort multipart upload");
            }
        }
    }

    /// The record for `target`. Unreadable records and records written for
    /// another target are ignored and left on disk.
    async fn load_record(&self, target: &str) -> Option<ResumeRecord> {
        let store = self.resume.as_ref()?;
        match store.load(target).await {
            Ok(record) => record,
            Err(err) => {
                warn!(path = %store.path_for(target).display(), error = %err, "Ignoring unreadable resume record");
                None
            }
        }
    }

    async fn checkpoint(&self, session: &UploadSession) {
        let Some(store) = &self.resume else {
            return;
        };
        let target = self.store.target_id(&session.key);
        let Some(record) = ResumeRecord::from_session(session, &target, self.part_algorithm())
        else {
            return;
        };
        if let Err(err) = store.save(&record).await {
            warn!(path = %store.path_for(&target).display(), error = %err, "Failed to write resume record");
        }
    }

    async fn forget(&self, key: &str) {
        let Some(store) = &self.resume else {
            return;
        };
        let target = self.store.target_id(key);
        if let Err(err) = store.remove(&target).await {
            warn!(path = %store.path_for(&target).display(), error = %err, "Failed to remove resume record");
        }
    }

    fn part_algorithm(&self) -> DigestAlgorithm {
        self.store.digest_algorithm()
    }

    fn report_retry(&self, part_number: u32, attempt: u32, err: &StorageError, delay: Duration) {
        warn!(
            part_number,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Part upload failed, retrying"
        );
        self.progress.emit(ProgressEvent::PartRetry {
            part_number,
            attempt,
            delay,
            error: err.to_string(),
        });
    }
}

/// Whether the resume record is rewritten after the `acknowledged`th part.
/// Interrupted uploads are always checkpointed before the run gives up.
fn checkpoint_due(acknowledged: usize) -> bool {
    acknowledged % CHECKPOINT_INTERVAL == 0
}

fn part_error(part_number: u32, err: RetryError) -> PipelineError {
    match err.into_parts() {
        Some((attempts, source)) => PipelineError::UploadFailed {
            part_number,
            attempts,
            source,
        },
        None => PipelineError::Cancelled,
    }
}

fn storage_error(operation: &'static str, err: RetryError) -> PipelineError {
    match err.into_parts() {
        Some((attempts, source)) => PipelineError::Storage {
            operation,
            attempts,
            source,
        },
        None => PipelineError::Cancelled,
    }
}

/// Regroups archive chunks into parts of exactly `part_size` bytes (the last
/// one may be shorter).
struct PartReader<'a> {
    stream: &'a mut ArchiveStream,
    pending: BytesMut,
    part_size: usize,
    eof: bool,
}

impl<'a> PartReader<'a> {
    fn new(stream: &'a mut ArchiveStream, part_size: usize) -> Self {
        Self {
            stream,
            pending: BytesMut::new(),
            part_size: part_size.max(1),
            eof: false,
        }
    }

    /// Next part and whether it is the final one. Reads one byte past the
    /// part boundary so the last part is known before it is sent.
    async fn next_part(&mut self) -> PipelineResult<Option<(Bytes, bool)>> {
        while !self.eof && self.pending.len() <= self.part_size {
            match self.stream.next_chunk().await? {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None => self.eof = true,
            }
        }
        if self.pending.is_empty() {
            return Ok(None);
        }
        let take = self.pending.len().min(self.part_size);
        let part = self.pending.split_to(take).freeze();
        Ok(Some((part, self.eof && self.pending.is_empty())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarlift_storage::MemoryStore;

    fn config(part_size: u64) -> UploadConfig {
        UploadConfig {
            part_size,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 2,
            ..UploadConfig::default()
        }
    }

    fn stream(data: Vec<u8>) -> ArchiveStream {
        ArchiveStream::from_reader(std::io::Cursor::new(data), DigestAlgorithm::Md5, 1000)
    }

    #[test]
    fn test_checkpoint_every_interval() {
        let due: Vec<usize> = (1..=40).filter(|&n| checkpoint_due(n)).collect();
        assert_eq!(due, vec![16, 32]);
    }

    #[tokio::test]
    async fn test_part_reader_boundaries() {
        let mut source = stream(vec![7u8; 2500]);
        let mut reader = PartReader::new(&mut source, 1000);

        let mut sizes = Vec::new();
        while let Some((part, last)) = reader.next_part().await.unwrap() {
            sizes.push((part.len(), last));
        }
        assert_eq!(sizes, vec![(1000, false), (1000, false), (500, true)]);
    }

    #[tokio::test]
    async fn test_part_reader_exact_multiple() {
        let mut source = stream(vec![1u8; 2000]);
        let mut reader = PartReader::new(&mut source, 1000);
        assert!(!reader.next_part().await.unwrap().unwrap().1);
        assert!(reader.next_part().await.unwrap().unwrap().1);
        assert!(reader.next_part().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_small_archive_single_shot() {
        let store = Arc::new(MemoryStore::new());
        let uploader = ChunkedUploader::new(store.clone(), &config(1000));
        let data = vec![3u8; 1000];

        let session = uploader.upload(&mut stream(data.clone()), "a.tar").await.unwrap();
        assert_eq!(session.mode, Some(UploadMode::SingleShot));
        assert_eq!(session.state, UploadState::Committed);
        assert_eq!(session.part_count(), 1);
        assert_eq!(store.object("a.tar").unwrap(), data);
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn test_large_archive_multipart() {
        let store = Arc::new(MemoryStore::new());
        let uploader = ChunkedUploader::new(store.clone(), &config(1000));
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 256) as u8).collect();

        let session = uploader.upload(&mut stream(data.clone()), "b.tar").await.unwrap();
        assert_eq!(session.mode, Some(UploadMode::Multipart));
        let numbers: Vec<u32> = session.parts().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(session.bytes_transferred, 2500);
        assert_eq!(store.object("b.tar").unwrap(), data);
        assert!(matches!(
            session.remote_digest,
            Some(tarlift_core::RemoteDigest::Composite { .. })
        ));
    }
}
