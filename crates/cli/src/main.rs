//! `archive-upload`: archive a directory, upload it and verify the result.

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Json, Toml};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tarlift_core::config::{AppConfig, CompressionConfig, StorageClass};
use tarlift_pipeline::{FailureKind, Pipeline, PipelineReport, ProgressEvent, ProgressSink};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Config file picked up from the working directory when `--config` is absent.
const DEFAULT_CONFIG_FILE: &str = "config.json";
const ENV_PREFIX: &str = "ARCHIVE_UPLOAD_";

const EXIT_INTERNAL: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_SOURCE_UNREADABLE: u8 = 3;
const EXIT_UPLOAD_FAILED: u8 = 4;
const EXIT_VERIFICATION_MISMATCH: u8 = 5;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "archive-upload")]
#[command(about = "Archive a directory and upload it to S3 with integrity verification")]
#[command(version)]
struct Cli {
    /// Directory to archive
    source_dir: PathBuf,

    /// Target path; its file name becomes the object key
    target_path: PathBuf,

    /// Configuration file (JSON when it ends in .json, TOML otherwise)
    #[arg(long, env = "ARCHIVE_UPLOAD_CONFIG")]
    config: Option<PathBuf>,

    /// Storage class: STANDARD, REDUCED_REDUNDANCY or STANDARD_IA
    #[arg(long)]
    storage_class: Option<StorageClass>,

    /// Multipart part size in bytes
    #[arg(long)]
    part_size: Option<u64>,

    /// Maximum parts in flight
    #[arg(long)]
    concurrency: Option<usize>,

    /// Compression: auto, none, gzip, xz or zstd
    #[arg(long)]
    compression: Option<CompressionConfig>,

    /// Retries per request after the first attempt
    #[arg(long)]
    max_retries: Option<u32>,

    /// Keep interrupted uploads open and resume them on the next run
    #[arg(long, default_value_t = false)]
    resume: bool,

    /// Directory for resume records
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Cancel the run after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
}

impl Cli {
    /// Apply command-line overrides on top of file and environment values.
    fn apply(&self, config: &mut AppConfig) {
        if let Some(class) = self.storage_class {
            config.storage.storage_class = class;
        }
        if let Some(part_size) = self.part_size {
            config.upload.part_size = part_size;
        }
        if let Some(concurrency) = self.concurrency {
            config.upload.concurrency = concurrency;
        }
        if let Some(compression) = self.compression {
            config.archive.compression = compression;
        }
        if let Some(max_retries) = self.max_retries {
            config.upload.max_retries = max_retries;
        }
        if self.resume {
            config.resume.enabled = true;
        }
        if let Some(dir) = &self.state_dir {
            config.resume.state_dir = Some(dir.clone());
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries only the report.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    debug!("archive-upload v{}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(report) => ExitCode::from(exit_code(report.failure_kind())),
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

/// Everything up to pipeline construction fails as a configuration error.
async fn run(cli: Cli) -> Result<PipelineReport> {
    let mut config = load_config(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let key = object_name(&cli.target_path)?;
    let store = tarlift_storage::from_config(&config.storage)
        .context("failed to initialize storage client")?;
    let pipeline = Pipeline::new(config, store).context("failed to build pipeline")?;

    let cancel = pipeline.cancellation_token();
    tokio::spawn(cancel_on_signal(
        cancel.clone(),
        cli.timeout.map(Duration::from_secs),
    ));

    let (progress, events) = ProgressSink::channel();
    let logger = tokio::spawn(log_progress(events));

    let report = pipeline
        .with_progress(progress)
        .run(&cli.source_dir, &key)
        .await;
    // The sink went away with the pipeline; give the logger a moment to drain.
    let _ = tokio::time::timeout(Duration::from_secs(1), logger).await;
    cancel.cancel();

    match &report.failure {
        None => info!(
            key = %report.key,
            bytes = report.bytes_transferred,
            parts = report.part_count,
            elapsed_ms = report.elapsed_ms,
            "Upload verified"
        ),
        Some(failure) => error!(kind = ?failure.kind, "{}", failure.message),
    }

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(err) => error!(error = %err, "Failed to render report"),
    }
    Ok(report)
}

/// Merge the config file, then `ARCHIVE_UPLOAD_*` environment variables.
fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let path = match path {
        Some(path) => {
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
            Some(path.to_path_buf())
        }
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            default.exists().then_some(default)
        }
    };

    let mut figment = Figment::new();
    if let Some(path) = &path {
        debug!(config_path = %path.display(), "Loading configuration from file");
        figment = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => figment.merge(Json::file(path)),
            _ => figment.merge(Toml::file(path)),
        };
    }
    figment = figment.merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]).split("__"));

    figment
        .extract()
        .map_err(|err| anyhow!(err).context("failed to load configuration"))
}

/// Object name for `target`: its final path component.
fn object_name(target: &Path) -> Result<String> {
    target
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .with_context(|| format!("target path {} has no file name", target.display()))
}

/// Cancel `cancel` on Ctrl-C or once `timeout` elapses.
async fn cancel_on_signal(cancel: CancellationToken, timeout: Option<Duration>) {
    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        Ok(()) = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling");
            cancel.cancel();
        }
        _ = deadline => {
            warn!(timeout_secs = timeout.map(|t| t.as_secs()), "Timed out, cancelling");
            cancel.cancel();
        }
    }
}

async fn log_progress(mut events: mpsc::UnboundedReceiver<ProgressEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ProgressEvent::StateChanged { to, .. } => info!(state = %to, "Pipeline state"),
            ProgressEvent::EntryArchived { path, size } => {
                debug!(path = %path.display(), size, "Archived")
            }
            ProgressEvent::EntrySkipped(entry) => {
                debug!(path = %entry.path.display(), reason = %entry.reason, "Skipped")
            }
            ProgressEvent::PartUploaded { part_number, size } => {
                info!(part_number, size, "Part uploaded")
            }
            ProgressEvent::PartReused { part_number, size } => {
                info!(part_number, size, "Part reused from previous run")
            }
            ProgressEvent::PartRetry {
                part_number,
                attempt,
                delay,
                error,
            } => warn!(
                part_number,
                attempt,
                delay_ms = delay.as_millis() as u64,
                %error,
                "Retrying part"
            ),
            ProgressEvent::Committed { parts, bytes } => info!(parts, bytes, "Upload committed"),
        }
    }
}

fn exit_code(kind: Option<FailureKind>) -> u8 {
    match kind {
        None => 0,
        Some(FailureKind::Config) => EXIT_CONFIG,
        Some(FailureKind::SourceUnreadable) => EXIT_SOURCE_UNREADABLE,
        Some(FailureKind::UploadFailed | FailureKind::CommitFailed) => EXIT_UPLOAD_FAILED,
        Some(FailureKind::VerificationMismatch) => EXIT_VERIFICATION_MISMATCH,
        Some(FailureKind::Cancelled) => EXIT_CANCELLED,
        Some(FailureKind::Archive | FailureKind::Internal) => EXIT_INTERNAL,
    }
}
