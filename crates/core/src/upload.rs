//! Upload session types and lifecycle.

use crate::hash::{CompositeDigest, Digest, DigestAlgorithm, RemoteDigest, composite_digest};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for an upload session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::UploadSession(format!("invalid upload ID: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upload session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// Created, nothing sent yet.
    Pending,
    /// Remote session open and accepting parts.
    InProgress,
    /// Object finalized on the remote side.
    Committed,
    /// Session was explicitly aborted.
    Aborted,
}

impl UploadState {
    /// Check if the session is still active (can receive parts).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    /// Check if the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

/// How the archive reaches the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    /// One PUT of the whole archive.
    SingleShot,
    Multipart,
}

/// Half-open byte range `[start, end)` within the archive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start + len,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// One segment of an upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPart {
    /// Part number, starting at 1.
    pub part_number: u32,
    pub range: ByteRange,
    /// Digest of the part bytes as sent.
    pub local_digest: Digest,
    /// ETag returned by the store once the part is acknowledged.
    pub remote_etag: Option<String>,
}

impl UploadPart {
    pub fn is_acknowledged(&self) -> bool {
        self.remote_etag.is_some()
    }

    /// The acknowledged ETag read as a whole-content digest, when it is one.
    pub fn acknowledged_digest(&self) -> Option<Digest> {
        match RemoteDigest::from_etag(self.local_digest.algorithm(), self.remote_etag.as_deref()?)
        {
            RemoteDigest::Whole { digest } => Some(digest),
            _ => None,
        }
    }
}

/// Expected number of parts for an archive of `total` bytes.
pub fn expected_part_count(total: u64, part_size: u64) -> u64 {
    if part_size == 0 {
        return 0;
    }
    total.div_ceil(part_size)
}

/// An upload of one archive to one object key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSession {
    /// Unique session identifier.
    pub id: UploadId,
    /// Target object key.
    pub key: String,
    pub mode: Option<UploadMode>,
    /// Remote multipart upload ID.
    pub multipart_id: Option<String>,
    pub state: UploadState,
    /// Part size for this upload.
    pub part_size: u64,
    parts: BTreeMap<u32, UploadPart>,
    /// Digest reported by the store on commit.
    pub remote_digest: Option<RemoteDigest>,
    /// Bytes actually sent over the network (reused parts excluded).
    pub bytes_transferred: u64,
    /// When the session was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// When the session was last updated.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl UploadSession {
    /// Create a new pending upload session.
    pub fn new(key: impl Into<String>, part_size: u64) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: UploadId::new(),
            key: key.into(),
            mode: None,
            multipart_id: None,
            state: UploadState::Pending,
            part_size,
            parts: BTreeMap::new(),
            remote_digest: None,
            bytes_transferred: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc();
    }

    /// Move from Pending to InProgress.
    pub fn start(&mut self, mode: UploadMode, multipart_id: Option<String>) -> crate::Result<()> {
        if self.state != UploadState::Pending {
            return Err(crate::Error::InvalidState(format!(
                "cannot start upload in state {:?}",
                self.state
            )));
        }
        if mode == UploadMode::Multipart && multipart_id.is_none() {
            return Err(crate::Error::UploadSession(
                "multipart upload requires a multipart ID".to_string(),
            ));
        }
        self.mode = Some(mode);
        self.multipart_id = multipart_id;
        self.state = UploadState::InProgress;
        self.touch();
        Ok(())
    }

    /// Record a part. Part numbers are unique within a session.
    pub fn record_part(&mut self, part: UploadPart) -> crate::Result<()> {
        if !self.state.is_active() {
            return Err(crate::Error::InvalidState(format!(
                "cannot record part {} in state {:?}",
                part.part_number, self.state
            )));
        }
        if part.part_number == 0 {
            return Err(crate::Error::UploadSession(
                "part numbers start at 1".to_string(),
            ));
        }
        if self.parts.contains_key(&part.part_number) {
            return Err(crate::Error::UploadSession(format!(
                "part {} recorded twice",
                part.part_number
            )));
        }
        self.parts.insert(part.part_number, part);
        self.touch();
        Ok(())
    }

    /// Finalize the session with the digest the store reported.
    pub fn commit(&mut self, remote_digest: RemoteDigest) -> crate::Result<()> {
        if !self.state.is_active() {
            return Err(crate::Error::InvalidState(format!(
                "cannot commit upload in state {:?}",
                self.state
            )));
        }
        if self.parts.is_empty() || !self.is_contiguous() {
            return Err(crate::Error::UploadSession(
                "parts must be contiguous from 1 before commit".to_string(),
            ));
        }
        if let Some(part) = self.parts.values().find(|p| !p.is_acknowledged()) {
            return Err(crate::Error::UploadSession(format!(
                "part {} was never acknowledged",
                part.part_number
            )));
        }
        self.remote_digest = Some(remote_digest);
        self.state = UploadState::Committed;
        self.touch();
        Ok(())
    }

    /// Mark the session aborted.
    pub fn abort(&mut self) -> crate::Result<()> {
        if self.state.is_terminal() {
            return Err(crate::Error::InvalidState(format!(
                "cannot abort upload in state {:?}",
                self.state
            )));
        }
        self.state = UploadState::Aborted;
        self.touch();
        Ok(())
    }

    /// Parts in part-number order.
    pub fn parts(&self) -> impl Iterator<Item = &UploadPart> {
        self.parts.values()
    }

    pub fn part(&self, part_number: u32) -> Option<&UploadPart> {
        self.parts.get(&part_number)
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Check that part numbers run 1..=n without gaps.
    pub fn is_contiguous(&self) -> bool {
        self.parts
            .keys()
            .zip(1u32..)
            .all(|(number, expected)| *number == expected)
    }

    /// Total bytes covered by recorded parts.
    pub fn total_bytes(&self) -> u64 {
        self.parts.values().map(|p| p.range.len()).sum()
    }

    /// `(part_number, etag)` pairs for the final commit, in order.
    pub fn completed_parts(&self) -> Vec<(u32, String)> {
        self.parts
            .values()
            .filter_map(|p| p.remote_etag.clone().map(|etag| (p.part_number, etag)))
            .collect()
    }

    /// Composite digest derived from the locally recorded part digests.
    pub fn composite_digest(&self, algorithm: DigestAlgorithm) -> crate::Result<CompositeDigest> {
        composite_digest(algorithm, self.parts.values().map(|p| &p.local_digest))
    }
}

/// Outcome of comparing the local archive digest with the stored object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub local_digest: Digest,
    pub remote_digest: RemoteDigest,
    /// Composite digest derived from part digests, when the remote reported one.
    pub derived_digest: Option<CompositeDigest>,
    pub local_size: u64,
    pub remote_size: u64,
    pub matches: bool,
    /// Parts whose acknowledged digest disagrees with the local one.
    pub discrepancy_segments: BTreeSet<u32>,
}
