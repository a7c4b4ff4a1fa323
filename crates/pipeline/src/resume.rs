//! On-disk record of an interrupted multipart upload.
//!
//! One JSON file per upload target under the state directory. The target is
//! the store's identity for the object (endpoint, bucket and full key), so
//! runs against different buckets or prefixes never see each other's
//! records. A later run for the same target and part size reopens the
//! multipart upload and skips parts the store already holds with a matching
//! digest.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tarlift_core::hash::{Digest, DigestAlgorithm};
use tarlift_core::upload::{UploadId, UploadSession};
use time::OffsetDateTime;

/// State directory used when none is configured.
pub const DEFAULT_STATE_DIR: &str = ".archive-upload";

/// One acknowledged part of an interrupted upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePart {
    pub part_number: u32,
    pub digest: Digest,
    pub etag: String,
    pub size: u64,
}

/// Everything needed to continue a multipart upload in a later run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub session_id: UploadId,
    /// Store identity of the object this upload writes.
    pub target: String,
    pub key: String,
    pub multipart_id: String,
    pub part_size: u64,
    pub algorithm: DigestAlgorithm,
    pub parts: Vec<ResumePart>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ResumeRecord {
    /// Snapshot the acknowledged parts of a multipart session.
    pub fn from_session(
        session: &UploadSession,
        target: &str,
        algorithm: DigestAlgorithm,
    ) -> Option<Self> {
        let multipart_id = session.multipart_id.clone()?;
        let parts = session
            .parts()
            .filter_map(|part| {
                Some(ResumePart {
                    part_number: part.part_number,
                    digest: part.local_digest.clone(),
                    etag: part.remote_etag.clone()?,
                    size: part.range.len(),
                })
            })
            .collect();
        Some(Self {
            session_id: session.id,
            target: target.to_string(),
            key: session.key.clone(),
            multipart_id,
            part_size: session.part_size,
            algorithm,
            parts,
            updated_at: OffsetDateTime::now_utc(),
        })
    }

    pub fn part(&self, part_number: u32) -> Option<&ResumePart> {
        self.parts.iter().find(|p| p.part_number == part_number)
    }
}

/// Directory of resume records.
#[derive(Clone, Debug)]
pub struct ResumeStore {
    dir: PathBuf,
}

impl ResumeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record file for `target`, named by the SHA-256 of the target.
    pub fn path_for(&self, target: &str) -> PathBuf {
        let name = Digest::compute(DigestAlgorithm::Sha256, target.as_bytes()).to_hex();
        self.dir.join(format!("{name}.json"))
    }

    /// Load the record for `target`. A missing file is `Ok(None)`.
    pub async fn load(&self, target: &str) -> io::Result<Option<ResumeRecord>> {
        let data = match tokio::fs::read(self.path_for(target)).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let record: ResumeRecord = serde_json::from_slice(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if record.target != target {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record belongs to {}", record.target),
            ));
        }
        Ok(Some(record))
    }

    /// Write the record atomically (temp file, then rename).
    pub async fn save(&self, record: &ResumeRecord) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&record.target);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(record).map_err(io::Error::other)?;
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    /// Delete the record for `target`, if any.
    pub async fn remove(&self, target: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.path_for(target)).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}
