//! Storage client trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use tarlift_core::config::StorageClass;
use tarlift_core::hash::{Digest, DigestAlgorithm, RemoteDigest};

/// Object metadata returned by `head`.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub size: u64,
    /// The object's checksum as the store reports it.
    pub digest: RemoteDigest,
    pub storage_class: Option<String>,
    pub last_modified: Option<time::OffsetDateTime>,
}

/// Options applied when an object is created.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub storage_class: StorageClass,
    pub content_type: Option<String>,
}

/// Identifier of an open multipart upload on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MultipartId(pub String);

impl MultipartId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MultipartId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Acknowledgement for one uploaded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    pub part_number: u32,
    pub etag: String,
}

impl PartReceipt {
    /// The ETag read as a whole-content digest, if the store exposes one.
    pub fn part_digest(&self, algorithm: DigestAlgorithm) -> Option<Digest> {
        match RemoteDigest::from_etag(algorithm, &self.etag) {
            RemoteDigest::Whole { digest } => Some(digest),
            _ => None,
        }
    }
}

/// A part reference used to complete a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Object storage client.
///
/// Every failure carries a transient-vs-permanent classification through
/// [`crate::StorageError::is_transient`]; callers decide retries from it.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Digest algorithm the store reflects in its ETags.
    fn digest_algorithm(&self) -> DigestAlgorithm {
        DigestAlgorithm::Md5
    }

    /// Upload a whole object in one request.
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        digest: &Digest,
        options: &PutOptions,
    ) -> StorageResult<RemoteDigest>;

    /// Open a multipart upload.
    async fn create_multipart(&self, key: &str, options: &PutOptions)
    -> StorageResult<MultipartId>;

    /// Upload one part. Re-sending a part number replaces the earlier part.
    async fn upload_part(
        &self,
        key: &str,
        upload: &MultipartId,
        part_number: u32,
        data: Bytes,
        digest: &Digest,
    ) -> StorageResult<PartReceipt>;

    /// Assemble the listed parts, in order, into the final object.
    async fn complete_multipart(
        &self,
        key: &str,
        upload: &MultipartId,
        parts: &[CompletedPart],
    ) -> StorageResult<RemoteDigest>;

    /// Discard a multipart upload and every part stored for it.
    async fn abort_multipart(&self, key: &str, upload: &MultipartId) -> StorageResult<()>;

    /// Parts the store currently holds for an open multipart upload.
    async fn list_parts(&self, key: &str, upload: &MultipartId)
    -> StorageResult<Vec<CompletedPart>>;

    /// Get object metadata.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get the backend name (for logging).
    fn backend_name(&self) -> &'static str;

    /// Stable identity of the object `key` resolves to: backend, endpoint,
    /// bucket and full key. Two stores share an identity only when they
    /// address the same remote object.
    fn target_id(&self, key: &str) -> String;

    /// Check that the backend is reachable and the target is accessible.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// need no connectivity check (e.g., in-memory).
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}
