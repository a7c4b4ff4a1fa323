//! Streaming digests, composite multipart digests and remote ETag parsing.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;

/// Hash algorithm used for archive and part digests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// MD5, the digest S3-compatible stores reflect in ETags.
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    /// Length of a raw digest in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha256 => 32,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }
}

impl Default for DigestAlgorithm {
    fn default() -> Self {
        Self::Md5
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            other => Err(crate::Error::InvalidDigest(format!(
                "unknown digest algorithm: {other}"
            ))),
        }
    }
}

/// A finalized digest value.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "DigestRepr", try_from = "DigestRepr")]
pub struct Digest {
    algorithm: DigestAlgorithm,
    bytes: Vec<u8>,
}

impl Digest {
    /// Wrap raw digest bytes, checking the length against the algorithm.
    pub fn from_bytes(algorithm: DigestAlgorithm, bytes: &[u8]) -> crate::Result<Self> {
        if bytes.len() != algorithm.output_len() {
            return Err(crate::Error::InvalidDigest(format!(
                "expected {} bytes for {algorithm}, got {}",
                algorithm.output_len(),
                bytes.len()
            )));
        }
        Ok(Self {
            algorithm,
            bytes: bytes.to_vec(),
        })
    }

    /// Compute the digest of a complete buffer.
    pub fn compute(algorithm: DigestAlgorithm, data: &[u8]) -> Self {
        let mut state = HasherState::new(algorithm);
        state.update(data);
        state.finalize()
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Parse from hex string.
    pub fn from_hex(algorithm: DigestAlgorithm, s: &str) -> crate::Result<Self> {
        let expected = algorithm.output_len() * 2;
        if s.len() != expected {
            return Err(crate::Error::InvalidDigest(format!(
                "expected {expected} hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = Vec::with_capacity(algorithm.output_len());
        for chunk in s.as_bytes().chunks(2) {
            let hex_str = std::str::from_utf8(chunk)
                .map_err(|e| crate::Error::InvalidDigest(e.to_string()))?;
            bytes.push(
                u8::from_str_radix(hex_str, 16)
                    .map_err(|e| crate::Error::InvalidDigest(e.to_string()))?,
            );
        }
        Ok(Self { algorithm, bytes })
    }

    /// Encode as lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Encode as base64 string (the `Content-MD5` header form).
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "Digest({}:{})", self.algorithm, &hex[..hex.len().min(16)])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Serialize, Deserialize)]
struct DigestRepr {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl From<Digest> for DigestRepr {
    fn from(digest: Digest) -> Self {
        Self {
            algorithm: digest.algorithm,
            hex: digest.to_hex(),
        }
    }
}

impl TryFrom<DigestRepr> for Digest {
    type Error = crate::Error;

    fn try_from(repr: DigestRepr) -> crate::Result<Self> {
        Digest::from_hex(repr.algorithm, &repr.hex)
    }
}

enum HasherState {
    Md5(Md5),
    Sha256(Sha256),
}

impl HasherState {
    fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Md5 => Self::Md5(Md5::new()),
            DigestAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    fn finalize(self) -> Digest {
        match self {
            Self::Md5(h) => Digest {
                algorithm: DigestAlgorithm::Md5,
                bytes: h.finalize().to_vec(),
            },
            Self::Sha256(h) => Digest {
                algorithm: DigestAlgorithm::Sha256,
                bytes: h.finalize().to_vec(),
            },
        }
    }
}

/// Incremental digest over a byte stream.
///
/// Chunks must be fed in stream order by a single owner. The final value is
/// only available once, through [`DigestAccumulator::finalize`]; there is no
/// way to peek at a partial digest.
pub struct DigestAccumulator {
    algorithm: DigestAlgorithm,
    state: Option<HasherState>,
    bytes: u64,
}

impl DigestAccumulator {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self {
            algorithm,
            state: Some(HasherState::new(algorithm)),
            bytes: 0,
        }
    }

    /// Append a chunk to the running hash.
    pub fn update(&mut self, chunk: &[u8]) -> crate::Result<()> {
        let state = self.state.as_mut().ok_or_else(|| {
            crate::Error::InvalidState("digest updated after finalize".to_string())
        })?;
        state.update(chunk);
        self.bytes += chunk.len() as u64;
        Ok(())
    }

    /// Produce the final digest. Can only be called once.
    pub fn finalize(&mut self) -> crate::Result<Digest> {
        let state = self.state.take().ok_or_else(|| {
            crate::Error::InvalidState("digest already finalized".to_string())
        })?;
        Ok(state.finalize())
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Number of bytes fed so far.
    pub fn bytes_accumulated(&self) -> u64 {
        self.bytes
    }

    pub fn is_finalized(&self) -> bool {
        self.state.is_none()
    }
}

/// A digest of concatenated part digests, as reported for multipart objects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeDigest {
    pub digest: Digest,
    pub part_count: u32,
}

impl fmt::Display for CompositeDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.digest.to_hex(), self.part_count)
    }
}

/// Derive the composite digest from per-part digests in part order.
pub fn composite_digest<'a>(
    algorithm: DigestAlgorithm,
    parts: impl IntoIterator<Item = &'a Digest>,
) -> crate::Result<CompositeDigest> {
    let mut state = HasherState::new(algorithm);
    let mut part_count = 0u32;
    for part in parts {
        if part.algorithm() != algorithm {
            return Err(crate::Error::AlgorithmMismatch {
                expected: algorithm.to_string(),
                actual: part.algorithm().to_string(),
            });
        }
        state.update(part.as_bytes());
        part_count += 1;
    }
    if part_count == 0 {
        return Err(crate::Error::InvalidDigest(
            "composite digest needs at least one part".to_string(),
        ));
    }
    Ok(CompositeDigest {
        digest: state.finalize(),
        part_count,
    })
}

/// A checksum reported by the remote store for an object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RemoteDigest {
    /// Digest of the full object content.
    Whole { digest: Digest },
    /// Digest-of-digests produced by a multipart upload.
    Composite { composite: CompositeDigest },
    /// A checksum this client cannot interpret (e.g. SSE-KMS ETags).
    Opaque { value: String },
}

impl RemoteDigest {
    /// Interpret an ETag header value.
    pub fn from_etag(algorithm: DigestAlgorithm, etag: &str) -> Self {
        let value = etag.trim().trim_matches('"');

        if let Some((hex, count)) = value.rsplit_once('-')
            && let Ok(part_count) = count.parse::<u32>()
            && let Ok(digest) = Digest::from_hex(algorithm, hex)
        {
            return Self::Composite {
                composite: CompositeDigest { digest, part_count },
            };
        }

        match Digest::from_hex(algorithm, &value.to_ascii_lowercase()) {
            Ok(digest) => Self::Whole { digest },
            Err(_) => Self::Opaque {
                value: value.to_string(),
            },
        }
    }

    pub fn whole(digest: Digest) -> Self {
        Self::Whole { digest }
    }

    pub fn composite(composite: CompositeDigest) -> Self {
        Self::Composite { composite }
    }

    /// The ETag form of this digest, without quotes.
    pub fn to_etag(&self) -> String {
        match self {
            Self::Whole { digest } => digest.to_hex(),
            Self::Composite { composite } => composite.to_string(),
            Self::Opaque { value } => value.clone(),
        }
    }
}

impl fmt::Display for RemoteDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_etag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_hex_roundtrip() {
        let digest = Digest::compute(DigestAlgorithm::Sha256, b"hello world");
        let parsed = Digest::from_hex(DigestAlgorithm::Sha256, &digest.to_hex()).unwrap();
        assert_eq!(digest, parsed);
        assert!(Digest::from_hex(DigestAlgorithm::Md5, &digest.to_hex()).is_err());
    }

    #[test]
    fn test_known_md5() {
        let digest = Digest::compute(DigestAlgorithm::Md5, b"hello world");
        assert_eq!(digest.to_hex(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(digest.to_base64(), "XrY7u+Ae7tCTyyK7j1rNww==");
    }

    #[test]
    fn test_accumulator_matches_one_shot() {
        let mut acc = DigestAccumulator::new(DigestAlgorithm::Md5);
        acc.update(b"hello ").unwrap();
        acc.update(b"").unwrap();
        acc.update(b"world").unwrap();
        assert_eq!(acc.bytes_accumulated(), 11);

        let digest = acc.finalize().unwrap();
        assert_eq!(digest, Digest::compute(DigestAlgorithm::Md5, b"hello world"));
    }

    #[test]
    fn test_accumulator_rejects_use_after_finalize() {
        let mut acc = DigestAccumulator::new(DigestAlgorithm::Sha256);
        acc.update(b"data").unwrap();
        acc.finalize().unwrap();
        assert!(acc.is_finalized());

        assert!(matches!(
            acc.update(b"more"),
            Err(crate::Error::InvalidState(_))
        ));
        assert!(matches!(acc.finalize(), Err(crate::Error::InvalidState(_))));
    }

    #[test]
    fn test_composite_digest_differs_from_whole() {
        let a = vec![b'a'; 64];
        let b = vec![b'b'; 16];
        let parts = [
            Digest::compute(DigestAlgorithm::Md5, &a),
            Digest::compute(DigestAlgorithm::Md5, &b),
        ];
        let composite = composite_digest(DigestAlgorithm::Md5, &parts).unwrap();
        assert_eq!(composite.part_count, 2);

        let mut concat = parts[0].as_bytes().to_vec();
        concat.extend_from_slice(parts[1].as_bytes());
        assert_eq!(
            composite.digest,
            Digest::compute(DigestAlgorithm::Md5, &concat)
        );

        let whole = Digest::compute(DigestAlgorithm::Md5, &[a, b].concat());
        assert_ne!(composite.digest, whole);
        assert!(composite.to_string().ends_with("-2"));
    }

    #[test]
    fn test_composite_digest_rejects_empty_and_mixed() {
        let none: [Digest; 0] = [];
        assert!(composite_digest(DigestAlgorithm::Md5, &none).is_err());

        let mixed = [Digest::compute(DigestAlgorithm::Sha256, b"x")];
        assert!(matches!(
            composite_digest(DigestAlgorithm::Md5, &mixed),
            Err(crate::Error::AlgorithmMismatch { .. })
        ));
    }

    #[test]
    fn test_remote_digest_from_etag() {
        let whole = RemoteDigest::from_etag(
            DigestAlgorithm::Md5,
            "\"5EB63BBBE01EEED093CB22BB8F5ACDC3\"",
        );
        assert_eq!(
            whole,
            RemoteDigest::whole(Digest::compute(DigestAlgorithm::Md5, b"hello world"))
        );

        let composite = RemoteDigest::from_etag(
            DigestAlgorithm::Md5,
            "\"5eb63bbbe01eeed093cb22bb8f5acdc3-3\"",
        );
        match &composite {
            RemoteDigest::Composite { composite } => assert_eq!(composite.part_count, 3),
            other => panic!("expected composite, got {other:?}"),
        }
        assert_eq!(composite.to_etag(), "5eb63bbbe01eeed093cb22bb8f5acdc3-3");

        let opaque = RemoteDigest::from_etag(DigestAlgorithm::Md5, "\"not-an-md5\"");
        assert!(matches!(opaque, RemoteDigest::Opaque { .. }));
    }

    #[test]
    fn test_digest_serde_roundtrip() {
        let digest = Digest::compute(DigestAlgorithm::Md5, b"serde");
        let json = serde_json::to_string(&digest).unwrap();
        assert!(json.contains("\"algorithm\":\"md5\""));
        let parsed: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(digest, parsed);
    }
}
