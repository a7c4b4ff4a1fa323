//! Streaming archive builder.
//!
//! The directory walk and tar serialization run on a blocking thread and push
//! raw tar bytes through a bounded channel. The async side compresses them,
//! hands out fixed-size chunks and feeds every chunk to the digest before it
//! leaves the stream. A full channel suspends the walk, so memory use does
//! not grow with the size of the tree.

use crate::compression::CompressionKind;
use crate::error::{PipelineError, PipelineResult};
use crate::progress::{ProgressEvent, ProgressSink, SkippedEntry};
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tarlift_core::hash::{Digest, DigestAccumulator, DigestAlgorithm};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Size of each write the tar thread pushes into the channel.
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Result of a fully consumed archive stream.
#[derive(Clone, Debug, Serialize)]
pub struct ArchiveSummary {
    /// Digest of the final (possibly compressed) bytes.
    pub digest: Digest,
    pub size: u64,
    /// Entries written to the archive, the root directory included.
    pub entries: u64,
    pub skipped: Vec<SkippedEntry>,
    pub compression: CompressionKind,
}

#[derive(Debug, Default)]
struct WalkSummary {
    entries: u64,
    skipped: Vec<SkippedEntry>,
}

/// Builds a deterministic tar archive of a directory tree.
#[derive(Clone, Debug)]
pub struct ArchiveBuilder {
    root: PathBuf,
    compression: CompressionKind,
    algorithm: DigestAlgorithm,
    chunk_size: usize,
    queue_depth: usize,
    progress: ProgressSink,
    cancel: CancellationToken,
}

impl ArchiveBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            compression: CompressionKind::None,
            algorithm: DigestAlgorithm::Md5,
            chunk_size: WRITE_BUFFER_SIZE,
            queue_depth: 16,
            progress: ProgressSink::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn compression(mut self, compression: CompressionKind) -> Self {
        self.compression = compression;
        self
    }

    pub fn digest_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Size of the chunks handed out by [`ArchiveStream::next_chunk`].
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Capacity of the channel between the tar thread and the stream.
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
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

    /// Validate the root and start the walk.
    #[instrument(skip(self), fields(root = %self.root.display(), compression = %self.compression))]
    pub async fn build(self) -> PipelineResult<ArchiveStream> {
        let root = check_root(&self.root).await?;
        let arc_root = root
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let (tx, mut rx) = mpsc::channel::<Bytes>(self.queue_depth);
        let progress = self.progress.clone();
        let cancel = self.cancel.clone();
        let walker = tokio::task::spawn_blocking(move || {
            let writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, ChannelWriter { tx });
            write_archive(writer, &root, &arc_root, &progress, &cancel)
        });

        let chunks = async_stream::stream! {
            while let Some(bytes) = rx.recv().await {
                yield Ok::<Bytes, io::Error>(bytes);
            }
        };
        let raw = StreamReader::new(Box::pin(chunks));
        let reader = self.compression.encode(raw);

        debug!("archive walk started");
        Ok(ArchiveStream::new(
            reader,
            self.algorithm,
            self.chunk_size,
            self.compression,
            Some(walker),
            self.cancel,
        ))
    }
}

async fn check_root(root: &Path) -> PipelineResult<PathBuf> {
    let unreadable = |source: io::Error| PipelineError::SourceUnreadable {
        path: root.to_path_buf(),
        source,
    };

    let metadata = tokio::fs::metadata(root).await.map_err(unreadable)?;
    if !metadata.is_dir() {
        return Err(unreadable(io::Error::new(
            io::ErrorKind::NotADirectory,
            "not a directory",
        )));
    }
    // Listing fails here rather than halfway through the upload.
    tokio::fs::read_dir(root).await.map_err(unreadable)?;
    tokio::fs::canonicalize(root).await.map_err(unreadable)
}

/// Blocking writer that forwards every write into the archive channel.
struct ChannelWriter {
    tx: mpsc::Sender<Bytes>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Bytes::copy_from_slice(buf))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive reader dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn write_archive<W: Write>(
    writer: W,
    root: &Path,
    arc_root: &Path,
    progress: &ProgressSink,
    cancel: &CancellationToken,
) -> io::Result<WalkSummary> {
    let mut builder = tar::Builder::new(writer);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    let mut walk = Walk {
        builder: &mut builder,
        root,
        progress,
        cancel,
        summary: WalkSummary::default(),
    };
    walk.directory(root, arc_root)?;
    let summary = walk.summary;

    let mut writer = builder.into_inner()?;
    writer.flush()?;
    Ok(summary)
}

struct Walk<'a, W: Write> {
    builder: &'a mut tar::Builder<W>,
    root: &'a Path,
    progress: &'a ProgressSink,
    cancel: &'a CancellationToken,
    summary: WalkSummary,
}

impl<W: Write> Walk<'_, W> {
    fn directory(&mut self, path: &Path, name: &Path) -> io::Result<()> {
        let listing = fs::read_dir(path).and_then(|dir| dir.collect::<io::Result<Vec<_>>>());
        let mut children = match listing {
            Ok(children) => children,
            Err(err) if is_skippable(&err) => {
                self.skip(path, format!("unreadable directory: {err}"));
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        children.sort_by_key(|entry| entry.file_name());

        self.builder.append_dir(name, path)?;
        self.archived(path, 0);

        for child in children {
            if self.cancel.is_cancelled() {
                return Err(io::Error::other("archive cancelled"));
            }
            let child_path = child.path();
            let child_name = name.join(child.file_name());
            self.entry(&child_path, &child_name)?;
        }
        Ok(())
    }

    fn entry(&mut self, path: &Path, name: &Path) -> io::Result<()> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if is_skippable(&err) => {
                self.skip(path, format!("vanished or unreadable: {err}"));
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let file_type = metadata.file_type();

        if file_type.is_dir() {
            self.directory(path, name)
        } else if file_type.is_file() {
            let mut file = match fs::File::open(path) {
                Ok(file) => file,
                Err(err) if is_skippable(&err) => {
                    self.skip(path, format!("unreadable file: {err}"));
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            self.builder.append_file(name, &mut file)?;
            self.archived(path, metadata.len());
            Ok(())
        } else if file_type.is_symlink() {
            self.builder.append_path_with_name(path, name)?;
            self.archived(path, 0);
            Ok(())
        } else {
            self.skip(path, "special file".to_string());
            Ok(())
        }
    }

    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }

    fn archived(&mut self, path: &Path, size: u64) {
        self.summary.entries += 1;
        self.progress.emit(ProgressEvent::EntryArchived {
            path: self.relative(path),
            size,
        });
    }

    fn skip(&mut self, path: &Path, reason: String) {
        let entry = SkippedEntry {
            path: self.relative(path),
            reason,
        };
        warn!(path = %entry.path.display(), reason = %entry.reason, "Skipping entry");
        self.progress.emit(ProgressEvent::EntrySkipped(entry.clone()));
        self.summary.skipped.push(entry);
    }
}

fn is_skippable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    )
}

/// Single-pass stream of archive bytes with the digest fed in lockstep.
pub struct ArchiveStream {
    reader: Pin<Box<dyn AsyncRead + Send>>,
    accumulator: DigestAccumulator,
    chunk_size: usize,
    compression: CompressionKind,
    walker: Option<JoinHandle<io::Result<WalkSummary>>>,
    cancel: CancellationToken,
    size: u64,
    summary: Option<ArchiveSummary>,
}

impl std::fmt::Debug for ArchiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveStream")
            .field("chunk_size", &self.chunk_size)
            .field("compression", &self.compression)
            .field("size", &self.size)
            .field("finished", &self.summary.is_some())
            .finish_non_exhaustive()
    }
}

impl ArchiveStream {
    fn new(
        reader: Pin<Box<dyn AsyncRead + Send>>,
        algorithm: DigestAlgorithm,
        chunk_size: usize,
        compression: CompressionKind,
        walker: Option<JoinHandle<io::Result<WalkSummary>>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader,
            accumulator: DigestAccumulator::new(algorithm),
            chunk_size: chunk_size.max(1),
            compression,
            walker,
            cancel,
            size: 0,
            summary: None,
        }
    }

    /// Stream an already serialized archive.
    pub fn from_reader<R>(reader: R, algorithm: DigestAlgorithm, chunk_size: usize) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self::new(
            Box::pin(reader),
            algorithm,
            chunk_size,
            CompressionKind::None,
            None,
            CancellationToken::new(),
        )
    }

    /// Observe `cancel` at every chunk boundary.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Next chunk of archive bytes, or `None` once the archive is complete.
    pub async fn next_chunk(&mut self) -> PipelineResult<Option<Bytes>> {
        if self.summary.is_some() {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let mut buf = BytesMut::with_capacity(self.chunk_size);
        while buf.len() < self.chunk_size {
            let read = self
                .reader
                .read_buf(&mut buf)
                .await
                .map_err(PipelineError::Archive)?;
            if read == 0 {
                break;
            }
        }

        if buf.is_empty() {
            self.complete().await?;
            return Ok(None);
        }

        self.accumulator.update(&buf)?;
        self.size += buf.len() as u64;
        Ok(Some(buf.freeze()))
    }

    async fn complete(&mut self) -> PipelineResult<()> {
        let walk = match self.walker.take() {
            Some(handle) => match handle.await {
                Ok(Ok(walk)) => walk,
                Ok(Err(_)) if self.cancel.is_cancelled() => return Err(PipelineError::Cancelled),
                Ok(Err(err)) => return Err(PipelineError::Archive(err)),
                Err(err) => {
                    return Err(PipelineError::Archive(io::Error::other(format!(
                        "archive task failed: {err}"
                    ))));
                }
            },
            None => WalkSummary::default(),
        };

        let digest = self.accumulator.finalize()?;
        debug!(
            size = self.size,
            entries = walk.entries,
            skipped = walk.skipped.len(),
            digest = %digest,
            "Archive complete"
        );
        self.summary = Some(ArchiveSummary {
            digest,
            size: self.size,
            entries: walk.entries,
            skipped: walk.skipped,
            compression: self.compression,
        });
        Ok(())
    }

    /// The summary of a fully consumed stream.
    pub fn finish(self) -> PipelineResult<ArchiveSummary> {
        self.summary.ok_or_else(|| {
            tarlift_core::Error::InvalidState("archive stream not fully consumed".to_string())
                .into()
        })
    }
}
