use bytes::Bytes;
use tarlift_core::hash::{Digest, DigestAlgorithm};

/// Compute MD5 of data as hex string
pub fn md5_hex(data: &[u8]) -> String {
    Digest::compute(DigestAlgorithm::Md5, data).to_hex()
}

pub fn md5(data: &[u8]) -> Digest {
    Digest::compute(DigestAlgorithm::Md5, data)
}

/// Generate deterministic test data using a seeded pseudo-random generator
/// Same seed produces same output (reproducible tests)
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    // Simple LCG (Linear Congruential Generator)
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_hex() {
        assert_eq!(md5_hex(b"hello world"), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn test_seeded_bytes_deterministic() {
        let data1 = seeded_bytes(42, 1000);
        let data2 = seeded_bytes(42, 1000);
        assert_eq!(data1, data2);
        assert_ne!(data1, seeded_bytes(43, 1000));
    }
}
