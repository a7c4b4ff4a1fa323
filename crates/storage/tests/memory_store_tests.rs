// S3 semantics of the in-memory store: whole-object ETags for single puts,
// composite ETags for multipart uploads, and multipart lifecycle errors.

mod common;

use common::{md5, md5_hex, seeded_bytes};
use tarlift_core::config::StorageClass;
use tarlift_core::hash::{Digest, DigestAlgorithm, RemoteDigest, composite_digest};
use tarlift_storage::{CompletedPart, MemoryStore, ObjectStore, PutOptions, StorageError};

fn options() -> PutOptions {
    PutOptions {
        storage_class: StorageClass::StandardIa,
        content_type: Some("application/gzip".to_string()),
    }
}

#[tokio::test]
async fn single_put_reports_whole_md5() {
    let store = MemoryStore::new();
    let data = seeded_bytes(1, 4096);

    let remote = store
        .put("backups/a.tar.gz", data.clone(), &md5(&data), &options())
        .await
        .unwrap();
    assert_eq!(remote, RemoteDigest::whole(md5(&data)));

    let meta = store.head("backups/a.tar.gz").await.unwrap();
    assert_eq!(meta.size, 4096);
    assert_eq!(meta.digest.to_etag(), md5_hex(&data));
    assert_eq!(meta.storage_class.as_deref(), Some("STANDARD_IA"));
    assert_eq!(
        store.content_type("backups/a.tar.gz").as_deref(),
        Some("application/gzip")
    );
}

#[tokio::test]
async fn put_rejects_wrong_digest() {
    let store = MemoryStore::new();
    let data = seeded_bytes(2, 128);
    let wrong = md5(b"something else");

    let err = store
        .put("a", data, &wrong, &PutOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::DigestMismatch { .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn multipart_reports_composite_digest() {
    let store = MemoryStore::new();
    let first = seeded_bytes(3, 5000);
    let second = seeded_bytes(4, 1200);

    let upload = store.create_multipart("obj", &options()).await.unwrap();
    // Parts may arrive out of order.
    let r2 = store
        .upload_part("obj", &upload, 2, second.clone(), &md5(&second))
        .await
        .unwrap();
    let r1 = store
        .upload_part("obj", &upload, 1, first.clone(), &md5(&first))
        .await
        .unwrap();
    assert_eq!(r1.part_digest(DigestAlgorithm::Md5), Some(md5(&first)));

    let listed = store.list_parts("obj", &upload).await.unwrap();
    assert_eq!(listed.len(), 2);

    let parts = vec![
        CompletedPart {
            part_number: 1,
            etag: r1.etag,
        },
        CompletedPart {
            part_number: 2,
            etag: r2.etag,
        },
    ];
    let remote = store
        .complete_multipart("obj", &upload, &parts)
        .await
        .unwrap();

    let expected = composite_digest(DigestAlgorithm::Md5, &[md5(&first), md5(&second)]).unwrap();
    assert_eq!(remote, RemoteDigest::composite(expected));

    let whole = Digest::compute(DigestAlgorithm::Md5, &[first.clone(), second.clone()].concat());
    assert_ne!(remote, RemoteDigest::whole(whole));

    let stored = store.object("obj").unwrap();
    assert_eq!(stored.len(), 6200);
    assert_eq!(&stored[..5000], &first[..]);
    assert_eq!(store.open_uploads(), 0);
}

#[tokio::test]
async fn complete_rejects_unknown_or_mismatched_parts() {
    let store = MemoryStore::new();
    let data = seeded_bytes(5, 100);
    let upload = store.create_multipart("obj", &options()).await.unwrap();
    store
        .upload_part("obj", &upload, 1, data.clone(), &md5(&data))
        .await
        .unwrap();

    let missing = [CompletedPart {
        part_number: 2,
        etag: md5_hex(&data),
    }];
    assert!(matches!(
        store.complete_multipart("obj", &upload, &missing).await,
        Err(StorageError::InvalidPart(_))
    ));

    let wrong_etag = [CompletedPart {
        part_number: 1,
        etag: md5_hex(b"other"),
    }];
    assert!(matches!(
        store.complete_multipart("obj", &upload, &wrong_etag).await,
        Err(StorageError::InvalidPart(_))
    ));

    // Failed completions leave the upload open.
    assert_eq!(store.open_uploads(), 1);
    assert!(store.head("obj").await.is_err());
}

#[tokio::test]
async fn abort_discards_parts() {
    let store = MemoryStore::new();
    let data = seeded_bytes(6, 100);
    let upload = store.create_multipart("obj", &options()).await.unwrap();
    store
        .upload_part("obj", &upload, 1, data.clone(), &md5(&data))
        .await
        .unwrap();

    store.abort_multipart("obj", &upload).await.unwrap();
    assert_eq!(store.open_uploads(), 0);

    assert!(matches!(
        store
            .upload_part("obj", &upload, 2, data.clone(), &md5(&data))
            .await,
        Err(StorageError::NoSuchUpload(_))
    ));
    assert!(matches!(
        store.list_parts("obj", &upload).await,
        Err(StorageError::NoSuchUpload(_))
    ));
    assert!(matches!(
        store.head("obj").await,
        Err(StorageError::NotFound(_))
    ));

    // Aborting twice is not an error.
    store.abort_multipart("obj", &upload).await.unwrap();
}

#[tokio::test]
async fn part_numbers_are_bounded() {
    let store = MemoryStore::new();
    let data = seeded_bytes(7, 10);
    let upload = store.create_multipart("obj", &options()).await.unwrap();

    for number in [0, tarlift_core::MAX_PARTS + 1] {
        assert!(matches!(
            store
                .upload_part("obj", &upload, number, data.clone(), &md5(&data))
                .await,
            Err(StorageError::InvalidPart(_))
        ));
    }
}

#[tokio::test]
async fn memory_store_is_always_healthy() {
    let store = MemoryStore::new();
    store.health_check().await.unwrap();
    assert_eq!(store.backend_name(), "memory");
}

#[test]
fn each_memory_store_is_its_own_target() {
    let a = MemoryStore::new();
    let b = MemoryStore::new();
    assert_eq!(a.target_id("k.tar"), a.target_id("k.tar"));
    assert_ne!(a.target_id("k.tar"), b.target_id("k.tar"));
    assert_ne!(a.target_id("k.tar"), a.target_id("j.tar"));
}
