//! Post-commit integrity verification.
//!
//! A multipart ETag is a digest of the part digests, not of the content, so
//! it is never compared with the whole-archive digest. Instead the expected
//! composite is derived from the part digests recorded during upload.

use crate::error::{PipelineError, PipelineResult};
use crate::retry::{RetryPolicy, with_backoff};
use std::collections::BTreeSet;
use std::sync::Arc;
use tarlift_core::hash::{Digest, RemoteDigest};
use tarlift_core::upload::{UploadSession, VerificationResult, expected_part_count};
use tarlift_storage::ObjectStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Compares the local archive digest with what the store reports.
#[derive(Clone)]
pub struct IntegrityVerifier {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl IntegrityVerifier {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fetch the object's metadata and reconcile it with the local digests.
    #[instrument(skip_all, fields(key = %session.key))]
    pub async fn verify(
        &self,
        local_digest: &Digest,
        local_size: u64,
        session: &UploadSession,
    ) -> PipelineResult<VerificationResult> {
        let meta = with_backoff(
            &self.retry,
            &self.cancel,
            || self.store.head(&session.key),
            |attempt, err, _| warn!(attempt, error = %err, "HEAD failed, retrying"),
        )
        .await
        .map_err(|err| match err.into_parts() {
            Some((attempts, source)) => PipelineError::Storage {
                operation: "head",
                attempts,
                source,
            },
            None => PipelineError::Cancelled,
        })?;

        let result = reconcile(local_digest, local_size, session, meta.digest, meta.size);
        debug!(
            matches = result.matches,
            remote = %result.remote_digest,
            remote_size = result.remote_size,
            "Verification finished"
        );
        Ok(result)
    }
}

/// Pure comparison of local state with the remote digest and size.
pub fn reconcile(
    local_digest: &Digest,
    local_size: u64,
    session: &UploadSession,
    remote_digest: RemoteDigest,
    remote_size: u64,
) -> VerificationResult {
    let discrepancy_segments = discrepancies(session);

    let (digest_matches, derived_digest) = match &remote_digest {
        RemoteDigest::Whole { digest } => (digest == local_digest, None),
        RemoteDigest::Composite { composite } => {
            // The part count must follow from the archive size, not from
            // whatever parts the session happens to hold.
            let expected = expected_part_count(local_size, session.part_size);
            if u64::from(composite.part_count) != expected {
                warn!(
                    remote_parts = composite.part_count,
                    expected_parts = expected,
                    "Remote part count does not match the archive size"
                );
            }
            match session.composite_digest(composite.digest.algorithm()) {
                Ok(derived) => (
                    &derived == composite && u64::from(derived.part_count) == expected,
                    Some(derived),
                ),
                Err(err) => {
                    warn!(error = %err, "Cannot derive composite digest from session parts");
                    (false, None)
                }
            }
        }
        RemoteDigest::Opaque { value } => {
            warn!(etag = %value, "Remote checksum cannot be interpreted");
            (false, None)
        }
    };

    let matches = digest_matches && remote_size == local_size && discrepancy_segments.is_empty();
    VerificationResult {
        local_digest: local_digest.clone(),
        remote_digest,
        derived_digest,
        local_size,
        remote_size,
        matches,
        discrepancy_segments,
    }
}

/// Parts whose acknowledgement disagrees with the bytes that were sent.
fn discrepancies(session: &UploadSession) -> BTreeSet<u32> {
    session
        .parts()
        .filter(|part| match part.acknowledged_digest() {
            Some(acknowledged) => acknowledged != part.local_digest,
            None => !part.is_acknowledged(),
        })
        .map(|part| part.part_number)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarlift_core::hash::{DigestAlgorithm, composite_digest};
    use tarlift_core::upload::{ByteRange, UploadMode, UploadPart};

    fn md5(data: &[u8]) -> Digest {
        Digest::compute(DigestAlgorithm::Md5, data)
    }

    fn multipart_session(parts: &[&[u8]]) -> UploadSession {
        let mut session = UploadSession::new("k", 4);
        session
            .start(UploadMode::Multipart, Some("mp".to_string()))
            .unwrap();
        let mut offset = 0;
        for (index, data) in parts.iter().enumerate() {
            session
                .record_part(UploadPart {
                    part_number: index as u32 + 1,
                    range: ByteRange::new(offset, data.len() as u64),
                    local_digest: md5(data),
                    remote_etag: Some(format!("\"{}\"", md5(data).to_hex())),
                })
                .unwrap();
            offset += data.len() as u64;
        }
        session
    }

    #[test]
    fn test_composite_reconciled_from_parts() {
        let session = multipart_session(&[b"abcd", b"efgh", b"ij"]);
        let whole = md5(b"abcdefghij");
        let remote = RemoteDigest::composite(
            composite_digest(
                DigestAlgorithm::Md5,
                &[md5(b"abcd"), md5(b"efgh"), md5(b"ij")],
            )
            .unwrap(),
        );

        let result = reconcile(&whole, 10, &session, remote, 10);
        assert!(result.matches);
        assert_eq!(result.derived_digest.unwrap().part_count, 3);
        assert!(result.discrepancy_segments.is_empty());
    }

    #[test]
    fn test_composite_never_compared_to_whole_digest() {
        let session = multipart_session(&[b"abcd", b"ef"]);
        let whole = md5(b"abcdef");
        // A store reporting the whole-content digest in composite form is wrong.
        let remote = RemoteDigest::Composite {
            composite: tarlift_core::CompositeDigest {
                digest: whole.clone(),
                part_count: 2,
            },
        };
        assert!(!reconcile(&whole, 6, &session, remote, 6).matches);
    }

    #[test]
    fn test_part_count_mismatch() {
        let session = multipart_session(&[b"abcd", b"ef"]);
        let mut composite =
            composite_digest(DigestAlgorithm::Md5, &[md5(b"abcd"), md5(b"ef")]).unwrap();
        composite.part_count = 3;
        let result = reconcile(
            &md5(b"abcdef"),
            6,
            &session,
            RemoteDigest::composite(composite),
            6,
        );
        assert!(!result.matches);
    }

    #[test]
    fn test_session_part_count_must_follow_archive_size() {
        // Two parts recorded and reported consistently, but a 10-byte archive
        // in 4-byte parts needs three: the third part never reached the store.
        let session = multipart_session(&[b"abcd", b"efgh"]);
        let remote = RemoteDigest::composite(
            composite_digest(DigestAlgorithm::Md5, &[md5(b"abcd"), md5(b"efgh")]).unwrap(),
        );

        let result = reconcile(&md5(b"abcdefghij"), 10, &session, remote.clone(), 10);
        assert!(!result.matches);
        assert_eq!(result.derived_digest.unwrap().part_count, 2);

        // The same session checked against the size it actually covers passes.
        assert!(reconcile(&md5(b"abcdefgh"), 8, &session, remote, 8).matches);
    }

    #[test]
    fn test_whole_digest_and_size() {
        let mut session = UploadSession::new("k", 4);
        session.start(UploadMode::SingleShot, None).unwrap();
        session
            .record_part(UploadPart {
                part_number: 1,
                range: ByteRange::new(0, 3),
                local_digest: md5(b"abc"),
                remote_etag: Some(md5(b"abc").to_hex()),
            })
            .unwrap();

        let ok = reconcile(
            &md5(b"abc"),
            3,
            &session,
            RemoteDigest::whole(md5(b"abc")),
            3,
        );
        assert!(ok.matches);
        assert!(ok.derived_digest.is_none());

        let short = reconcile(
            &md5(b"abc"),
            3,
            &session,
            RemoteDigest::whole(md5(b"abc")),
            2,
        );
        assert!(!short.matches);
    }

    #[test]
    fn test_corrupted_part_is_reported() {
        let mut session = UploadSession::new("k", 4);
        session
            .start(UploadMode::Multipart, Some("mp".to_string()))
            .unwrap();
        session
            .record_part(UploadPart {
                part_number: 1,
                range: ByteRange::new(0, 4),
                local_digest: md5(b"abcd"),
                remote_etag: Some(md5(b"abcd").to_hex()),
            })
            .unwrap();
        session
            .record_part(UploadPart {
                part_number: 2,
                range: ByteRange::new(4, 2),
                local_digest: md5(b"ef"),
                remote_etag: Some(md5(b"eX").to_hex()),
            })
            .unwrap();

        let remote = RemoteDigest::composite(
            composite_digest(DigestAlgorithm::Md5, &[md5(b"abcd"), md5(b"eX")]).unwrap(),
        );
        let result = reconcile(&md5(b"abcdef"), 6, &session, remote, 6);
        assert!(!result.matches);
        assert_eq!(result.discrepancy_segments, BTreeSet::from([2]));
    }

    #[test]
    fn test_opaque_never_verifies() {
        let session = multipart_session(&[b"abc"]);
        let remote = RemoteDigest::Opaque {
            value: "kms-managed".to_string(),
        };
        assert!(!reconcile(&md5(b"abc"), 3, &session, remote, 3).matches);
    }
}
