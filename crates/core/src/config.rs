//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// S3 storage class applied to the uploaded object.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageClass {
    #[default]
    Standard,
    ReducedRedundancy,
    StandardIa,
}

impl StorageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "STANDARD",
            Self::ReducedRedundancy => "REDUCED_REDUNDANCY",
            Self::StandardIa => "STANDARD_IA",
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageClass {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "STANDARD" => Ok(Self::Standard),
            "REDUCED_REDUNDANCY" => Ok(Self::ReducedRedundancy),
            "STANDARD_IA" => Ok(Self::StandardIa),
            other => Err(crate::Error::config(
                "storage_class",
                format!(
                    "unknown storage class {other:?} (expected STANDARD, REDUCED_REDUNDANCY or STANDARD_IA)"
                ),
            )),
        }
    }
}

/// Compression applied to the archive stream.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionConfig {
    /// Pick from the target file extension.
    #[default]
    Auto,
    /// Plain tar.
    None,
    Gzip,
    Xz,
    Zstd,
}

impl FromStr for CompressionConfig {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "none" => Ok(Self::None),
            "gzip" | "gz" => Ok(Self::Gzip),
            "xz" => Ok(Self::Xz),
            "zstd" | "zst" => Ok(Self::Zstd),
            other => Err(crate::Error::config(
                "archive.compression",
                format!("unknown compression {other:?}"),
            )),
        }
    }
}

/// S3 target configuration.
///
/// Flattened into [`AppConfig`], so the top-level keys of a config file
/// (`bucket_name`, `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`) map here.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bucket name (required).
    #[serde(default, alias = "bucket_name")]
    pub bucket: Option<String>,
    /// Optional endpoint URL (for MinIO, etc.).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// AWS region.
    #[serde(default)]
    pub region: Option<String>,
    /// Optional key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// AWS access key ID. Falls back to the default credential chain if not set.
    /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
    #[serde(default, alias = "AWS_ACCESS_KEY_ID", alias = "aws_access_key_id")]
    pub access_key_id: Option<String>,
    /// AWS secret access key. Falls back to the default credential chain if not set.
    #[serde(
        default,
        alias = "AWS_SECRET_ACCESS_KEY",
        alias = "aws_secret_access_key"
    )]
    pub secret_access_key: Option<String>,
    /// Force path-style URLs (e.g., `endpoint/bucket/key` instead of `bucket.endpoint/key`).
    /// Required for MinIO and some S3-compatible services.
    #[serde(default)]
    pub force_path_style: bool,
    /// Storage class for the uploaded object.
    #[serde(default)]
    pub storage_class: StorageClass,
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> crate::Result<()> {
        match self.bucket.as_deref().map(str::trim) {
            None | Some("") => return Err(crate::Error::config("bucket", "is required")),
            Some(bucket) if bucket.contains('/') => {
                return Err(crate::Error::config("bucket", "must not contain '/'"));
            }
            _ => {}
        }

        match (
            self.access_key_id.as_ref(),
            self.secret_access_key.as_ref(),
        ) {
            (Some(_), Some(_)) | (None, None) => {}
            (Some(_), None) => {
                return Err(crate::Error::config(
                    "secret_access_key",
                    "required when access_key_id is set",
                ));
            }
            (None, Some(_)) => {
                return Err(crate::Error::config(
                    "access_key_id",
                    "required when secret_access_key is set",
                ));
            }
        }

        if let Some(prefix) = &self.prefix
            && prefix.split('/').any(|segment| segment == "..")
        {
            return Err(crate::Error::config(
                "prefix",
                "must not contain '..' segments",
            ));
        }

        Ok(())
    }

    /// The bucket name, or an empty string when unset.
    pub fn bucket_name(&self) -> &str {
        self.bucket.as_deref().unwrap_or_default()
    }

    /// Build the object key for `name` under the configured prefix.
    pub fn object_key(&self, name: &str) -> String {
        let name = name.trim_start_matches('/');
        match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}/{name}"),
            _ => name.to_string(),
        }
    }
}

/// Multipart upload tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Part size in bytes.
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    /// Maximum number of parts in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Retries per request after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay in milliseconds (doubles per attempt).
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Upper bound on a single backoff delay in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Extra attempts for the final multipart commit.
    #[serde(default = "default_commit_retries")]
    pub commit_retries: u32,
    /// Capacity of the raw archive channel, in chunks.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_part_size() -> u64 {
    crate::DEFAULT_PART_SIZE
}

fn default_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    8_000
}

fn default_commit_retries() -> u32 {
    1
}

fn default_queue_depth() -> usize {
    16
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            commit_retries: default_commit_retries(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl UploadConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if !(crate::MIN_PART_SIZE..=crate::MAX_PART_SIZE).contains(&self.part_size) {
            return Err(crate::Error::config(
                "upload.part_size",
                format!(
                    "{} is outside {}..={} bytes",
                    self.part_size,
                    crate::MIN_PART_SIZE,
                    crate::MAX_PART_SIZE
                ),
            ));
        }
        if !(1..=64).contains(&self.concurrency) {
            return Err(crate::Error::config(
                "upload.concurrency",
                format!("{} is outside 1..=64", self.concurrency),
            ));
        }
        if self.queue_depth == 0 {
            return Err(crate::Error::config(
                "upload.queue_depth",
                "must be at least 1",
            ));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(crate::Error::config(
                "upload.retry_max_delay_ms",
                "must not be smaller than upload.retry_base_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Archive serialization settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub compression: CompressionConfig,
    /// Size of the chunks read from the compressed stream.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_chunk_size() -> usize {
    64 * 1024
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression: CompressionConfig::default(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl ArchiveConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if !(4 * 1024..=16 * 1024 * 1024).contains(&self.chunk_size) {
            return Err(crate::Error::config(
                "archive.chunk_size",
                format!("{} is outside 4 KiB..=16 MiB", self.chunk_size),
            ));
        }
        Ok(())
    }
}

/// Resumable session records.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResumeConfig {
    /// Keep interrupted multipart uploads open and resume them on the next run.
    #[serde(default)]
    pub enabled: bool,
    /// Directory holding session records.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Upload target.
    #[serde(flatten)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub resume: ResumeConfig,
}

impl AppConfig {
    /// Validate every section, reporting the first offending field.
    pub fn validate(&self) -> crate::Result<()> {
        self.storage.validate()?;
        self.upload.validate()?;
        self.archive.validate()?;
        Ok(())
    }

    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses the minimum part size and millisecond backoff.
    pub fn for_testing() -> Self {
        Self {
            storage: StorageConfig {
                bucket: Some("test-bucket".to_string()),
                ..StorageConfig::default()
            },
            upload: UploadConfig {
                part_size: crate::MIN_PART_SIZE,
                retry_base_delay_ms: 1,
                retry_max_delay_ms: 4,
                ..UploadConfig::default()
            },
            archive: ArchiveConfig::default(),
            resume: ResumeConfig::default(),
        }
    }
}
