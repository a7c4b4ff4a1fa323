//! Archive compression.
//!
//! Compression sits between the raw tar stream and the digest, so every
//! digest in the pipeline describes the bytes actually uploaded.

use async_compression::Level;
use async_compression::tokio::bufread::{GzipEncoder, XzEncoder, ZstdEncoder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::pin::Pin;
use tarlift_core::config::CompressionConfig;
use tokio::io::{AsyncBufRead, AsyncRead};

/// Concrete compression applied to an archive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    None,
    Gzip,
    Xz,
    Zstd,
}

impl CompressionKind {
    /// Resolve the configured compression, using the target name for `auto`.
    pub fn resolve(config: CompressionConfig, target: &Path) -> Self {
        match config {
            CompressionConfig::Auto => Self::from_extension(target),
            CompressionConfig::None => Self::None,
            CompressionConfig::Gzip => Self::Gzip,
            CompressionConfig::Xz => Self::Xz,
            CompressionConfig::Zstd => Self::Zstd,
        }
    }

    /// Pick compression from a file name (`.tar.gz`, `.tgz`, `.tar.xz`, ...).
    pub fn from_extension(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("gz" | "tgz") => Self::Gzip,
            Some("xz" | "txz") => Self::Xz,
            Some("zst" | "zstd" | "tzst") => Self::Zstd,
            _ => Self::None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::None => "application/x-tar",
            Self::Gzip => "application/gzip",
            Self::Xz => "application/x-xz",
            Self::Zstd => "application/zstd",
        }
    }

    /// Wrap a raw tar reader with the matching encoder.
    pub fn encode<'a, R>(&self, reader: R) -> Pin<Box<dyn AsyncRead + Send + 'a>>
    where
        R: AsyncBufRead + Send + 'a,
    {
        match self {
            Self::None => Box::pin(reader),
            Self::Gzip => Box::pin(GzipEncoder::with_quality(reader, Level::Default)),
            Self::Xz => Box::pin(XzEncoder::with_quality(reader, Level::Default)),
            Self::Zstd => Box::pin(ZstdEncoder::with_quality(reader, Level::Default)),
        }
    }
}

impl std::fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        };
        f.write_str(name)
    }
}
