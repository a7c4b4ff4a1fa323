//! In-process object store with S3 ETag semantics.
//!
//! Single puts report the MD5 of the object; completed multipart uploads
//! report `md5(concat(part md5s))-N`, exactly like S3. Used by tests and
//! anywhere a throwaway target is needed.

use crate::error::{StorageError, StorageResult};
use crate::traits::{CompletedPart, MultipartId, ObjectMeta, ObjectStore, PartReceipt, PutOptions};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tarlift_core::config::StorageClass;
use tarlift_core::hash::{Digest, DigestAlgorithm, RemoteDigest, composite_digest};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    digest: RemoteDigest,
    storage_class: StorageClass,
    content_type: Option<String>,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    options: PutOptions,
    parts: BTreeMap<u32, (Bytes, Digest)>,
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Object store held entirely in memory.
#[derive(Debug)]
pub struct MemoryStore {
    instance: u64,
    objects: Mutex<HashMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    next_upload: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            objects: Mutex::default(),
            uploads: Mutex::default(),
            next_upload: AtomicU64::new(0),
        }
    }
}

impl MemoryStore {
    /// A new, empty store. Every instance is a distinct target.
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents of a stored object.
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.lock_objects().get(key).map(|o| o.data.clone())
    }

    /// Content type recorded for a stored object.
    pub fn content_type(&self, key: &str) -> Option<String> {
        self.lock_objects()
            .get(key)
            .and_then(|o| o.content_type.clone())
    }

    /// Number of multipart uploads neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.lock_uploads().len()
    }

    fn lock_objects(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredObject>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_uploads(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingUpload>> {
        self.uploads.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_key(key: &str) -> StorageResult<()> {
        if key.is_empty() || key.starts_with('/') {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn check_digest(data: &[u8], digest: &Digest) -> StorageResult<()> {
        let actual = Digest::compute(digest.algorithm(), data);
        if &actual != digest {
            return Err(StorageError::DigestMismatch {
                expected: digest.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        digest: &Digest,
        options: &PutOptions,
    ) -> StorageResult<RemoteDigest> {
        Self::check_key(key)?;
        Self::check_digest(&data, digest)?;

        let remote = RemoteDigest::whole(Digest::compute(DigestAlgorithm::Md5, &data));
        self.lock_objects().insert(
            key.to_string(),
            StoredObject {
                data,
                digest: remote.clone(),
                storage_class: options.storage_class,
                content_type: options.content_type.clone(),
            },
        );
        Ok(remote)
    }

    async fn create_multipart(
        &self,
        key: &str,
        options: &PutOptions,
    ) -> StorageResult<MultipartId> {
        Self::check_key(key)?;
        let id = format!("mem-{}", self.next_upload.fetch_add(1, Ordering::Relaxed) + 1);
        self.lock_uploads().insert(
            id.clone(),
            PendingUpload {
                key: key.to_string(),
                options: options.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(MultipartId(id))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload: &MultipartId,
        part_number: u32,
        data: Bytes,
        digest: &Digest,
    ) -> StorageResult<PartReceipt> {
        if !(1..=tarlift_core::MAX_PARTS).contains(&part_number) {
            return Err(StorageError::InvalidPart(format!(
                "part number {part_number}"
            )));
        }
        Self::check_digest(&data, digest)?;

        let mut uploads = self.lock_uploads();
        let pending = uploads
            .get_mut(upload.as_str())
            .filter(|p| p.key == key)
            .ok_or_else(|| StorageError::NoSuchUpload(upload.to_string()))?;

        let part_md5 = Digest::compute(DigestAlgorithm::Md5, &data);
        let etag = format!("\"{}\"", part_md5.to_hex());
        pending.parts.insert(part_number, (data, part_md5));
        Ok(PartReceipt { part_number, etag })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload: &MultipartId,
        parts: &[CompletedPart],
    ) -> StorageResult<RemoteDigest> {
        if parts.is_empty() {
            return Err(StorageError::InvalidPart("no parts listed".to_string()));
        }
        if parts
            .windows(2)
            .any(|w| w[0].part_number >= w[1].part_number)
        {
            return Err(StorageError::InvalidPart(
                "parts must be listed in ascending order".to_string(),
            ));
        }

        let pending = {
            let mut uploads = self.lock_uploads();
            let pending = uploads
                .get(upload.as_str())
                .filter(|p| p.key == key)
                .ok_or_else(|| StorageError::NoSuchUpload(upload.to_string()))?;
            for part in parts {
                let (_, md5) = pending.parts.get(&part.part_number).ok_or_else(|| {
                    StorageError::InvalidPart(format!(
                        "part {} was never uploaded",
                        part.part_number
                    ))
                })?;
                if part.etag.trim_matches('"') != md5.to_hex() {
                    return Err(StorageError::InvalidPart(format!(
                        "ETag mismatch for part {}",
                        part.part_number
                    )));
                }
            }
            uploads
                .remove(upload.as_str())
                .ok_or_else(|| StorageError::NoSuchUpload(upload.to_string()))?
        };

        let mut data = BytesMut::new();
        let mut digests = Vec::with_capacity(parts.len());
        for part in parts {
            if let Some((bytes, md5)) = pending.parts.get(&part.part_number) {
                data.extend_from_slice(bytes);
                digests.push(md5.clone());
            }
        }
        let composite = composite_digest(DigestAlgorithm::Md5, &digests)
            .map_err(|e| StorageError::InvalidPart(e.to_string()))?;
        let remote = RemoteDigest::composite(composite);

        self.lock_objects().insert(
            key.to_string(),
            StoredObject {
                data: data.freeze(),
                digest: remote.clone(),
                storage_class: pending.options.storage_class,
                content_type: pending.options.content_type.clone(),
            },
        );
        Ok(remote)
    }

    async fn abort_multipart(&self, _key: &str, upload: &MultipartId) -> StorageResult<()> {
        self.lock_uploads().remove(upload.as_str());
        Ok(())
    }

    async fn list_parts(
        &self,
        key: &str,
        upload: &MultipartId,
    ) -> StorageResult<Vec<CompletedPart>> {
        let uploads = self.lock_uploads();
        let pending = uploads
            .get(upload.as_str())
            .filter(|p| p.key == key)
            .ok_or_else(|| StorageError::NoSuchUpload(upload.to_string()))?;
        Ok(pending
            .parts
            .iter()
            .map(|(number, (_, md5))| CompletedPart {
                part_number: *number,
                etag: format!("\"{}\"", md5.to_hex()),
            })
            .collect())
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let objects = self.lock_objects();
        let object = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectMeta {
            size: object.data.len() as u64,
            digest: object.digest.clone(),
            storage_class: Some(object.storage_class.to_string()),
            last_modified: None,
        })
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn target_id(&self, key: &str) -> String {
        format!("memory://{}/{key}", self.instance)
    }
}
