//! Outbound events delivered to the shell
//!
//! All events are immutable values. A job produces any number of progress
//! and status events, at most one [`ErrorEvent`], and exactly one
//! [`CompletionEvent`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::types::{JobId, JobStatus};

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Bytes transferred so far for one job
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub bytes_sent: u64,
    pub bytes_total: u64,
    pub timestamp_ms: u64,
}

/// A non-terminal status change (Connecting, Uploading, Verifying, or a
/// retry going back to Queued)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Attempt number this status belongs to (0 for the first)
    pub attempt: u32,
    /// Why the job was re-queued, for retries
    pub reason: Option<String>,
    pub timestamp_ms: u64,
}

/// Terminal failure of a job
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub job_id: JobId,
    pub kind: ErrorKind,
    pub message: String,
    /// The underlying error was transient; a manual retry may succeed
    pub retry_eligible: bool,
}

/// Terminal state of a job, emitted exactly once
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    pub duration: Duration,
    pub bytes_sent: u64,
}

/// Everything that flows over the event bus
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferEvent {
    Progress(ProgressEvent),
    Status(StatusEvent),
    Error(ErrorEvent),
    Completed(CompletionEvent),
}

impl TransferEvent {
    /// Job this event belongs to
    pub fn job_id(&self) -> JobId {
        match self {
            TransferEvent::Progress(e) => e.job_id,
            TransferEvent::Status(e) => e.job_id,
            TransferEvent::Error(e) => e.job_id,
            TransferEvent::Completed(e) => e.job_id,
        }
    }

    /// Progress may be coalesced under backpressure; nothing else may
    pub fn is_coalescable(&self) -> bool {
        matches!(self, TransferEvent::Progress(_))
    }

    /// The job's final event
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferEvent::Completed(_))
    }
}
