use bytes::Bytes;
use std::path::{Path, PathBuf};
use tarlift_core::config::UploadConfig;
use tarlift_core::hash::{Digest, DigestAlgorithm};

pub fn md5(data: &[u8]) -> Digest {
    Digest::compute(DigestAlgorithm::Md5, data)
}

/// Generate deterministic test data using a seeded pseudo-random generator
/// Same seed produces same output (reproducible tests)
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Upload settings with tiny parts and millisecond backoff.
#[allow(dead_code)]
pub fn test_upload_config(part_size: u64) -> UploadConfig {
    UploadConfig {
        part_size,
        concurrency: 4,
        max_retries: 3,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 4,
        commit_retries: 1,
        queue_depth: 4,
    }
}

/// Create `files` (relative path, contents) under a fresh `root`.
#[allow(dead_code)]
pub fn write_tree(root: &Path, files: &[(&str, &[u8])]) -> PathBuf {
    std::fs::create_dir_all(root).unwrap();
    for (path, contents) in files {
        let path = root.join(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }
    root.to_path_buf()
}
