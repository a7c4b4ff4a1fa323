//! Incremental progress events.

use crate::orchestrator::PipelineState;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Why an entry was left out of the archive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    /// Path relative to the archived root.
    pub path: PathBuf,
    pub reason: String,
}

/// Progress reported while the pipeline runs.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
    EntryArchived {
        path: PathBuf,
        size: u64,
    },
    EntrySkipped(SkippedEntry),
    PartUploaded {
        part_number: u32,
        size: u64,
    },
    /// A part from a previous run was already stored with the same digest.
    PartReused {
        part_number: u32,
        size: u64,
    },
    PartRetry {
        part_number: u32,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Committed {
        parts: usize,
        bytes: u64,
    },
}

/// Sending half for progress events. Sends never block and never fail.
#[derive(Clone, Debug, Default)]
pub struct ProgressSink(Option<mpsc::UnboundedSender<ProgressEvent>>);

impl ProgressSink {
    /// A sink that drops every event.
    pub fn disabled() -> Self {
        Self(None)
    }

    /// Create a sink and the receiver that observes it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(Some(tx)), rx)
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.0 {
            // Receiver gone means nobody is listening.
            let _ = tx.send(event);
        }
    }
}
