//! Object storage client for the tarlift pipeline.
//!
//! This crate provides:
//! - The `ObjectStore` trait: single puts, multipart uploads, and metadata
//! - Transient-vs-permanent error classification for retry decisions
//! - Backends: S3-compatible (AWS SDK) and in-memory

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{memory::MemoryStore, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use traits::{CompletedPart, MultipartId, ObjectMeta, ObjectStore, PartReceipt, PutOptions};

use std::sync::Arc;
use tarlift_core::config::StorageConfig;

/// Create an object store from configuration.
pub fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config
        .validate()
        .map_err(|e| StorageError::Config(e.to_string()))?;

    let backend = S3Backend::new(config)?;
    tracing::debug!(backend = ?backend, "Initialized S3 backend");
    Ok(Arc::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarlift_core::config::StorageClass;

    #[tokio::test]
    async fn from_config_s3_ok() {
        let config = StorageConfig {
            bucket: Some("bucket".to_string()),
            endpoint: Some("minio:9000".to_string()),
            region: Some("us-east-1".to_string()),
            prefix: Some("backups".to_string()),
            access_key_id: None,
            secret_access_key: None,
            force_path_style: true,
            storage_class: StorageClass::StandardIa,
        };

        let store = from_config(&config).unwrap();
        assert_eq!(store.backend_name(), "s3");
    }

    #[tokio::test]
    async fn from_config_rejects_partial_credentials() {
        let config = StorageConfig {
            bucket: Some("bucket".to_string()),
            access_key_id: Some("access".to_string()),
            ..StorageConfig::default()
        };

        match from_config(&config) {
            Ok(_) => panic!("expected error"),
            Err(StorageError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
