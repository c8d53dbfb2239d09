//! Shared types for the dispatch pipeline.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::trigger::Recipient;

// ── Request state ───────────────────────────────────────────────────

/// State of a single trigger file moving through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Seen by a directory scan.
    Discovered,
    /// Settle timer running.
    Settling,
    /// Settled; extracting recipient and reading content.
    Sending,
    /// Handed to the mailer, waiting for the outcome.
    Finalizing,
    /// Delivered. Terminal.
    Completed,
    /// Rejected, unreadable or not delivered. Terminal.
    Failed,
}

impl RequestState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: RequestState) -> bool {
        use RequestState::*;

        matches!(
            (self, target),
            (Discovered, Settling)
                | (Settling, Sending)
                | (Sending, Finalizing)
                | (Sending, Failed)
                | (Finalizing, Completed)
                | (Finalizing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Discovered => "discovered",
            Self::Settling => "settling",
            Self::Sending => "sending",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// ── Watch request ───────────────────────────────────────────────────

/// In-memory record for one trigger file. Never persisted.
#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub id: Uuid,
    pub path: PathBuf,
    pub file_name: String,
    pub discovered_at: DateTime<Utc>,
    pub state: RequestState,
    /// Set once the file name has been accepted.
    pub recipient: Option<Recipient>,
    /// Taken at settle time, before the body is read. A failed file is
    /// parked under this fingerprint, so a rewrite during the send still
    /// counts as a change.
    pub fingerprint: Option<FileFingerprint>,
}

impl WatchRequest {
    pub fn new(path: PathBuf, file_name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            path,
            file_name,
            discovered_at: Utc::now(),
            state: RequestState::Discovered,
            recipient: None,
            fingerprint: None,
        }
    }

    /// Move to `target`. Returns `false` and leaves the state alone if the
    /// transition is not allowed.
    pub fn transition_to(&mut self, target: RequestState) -> bool {
        if !self.state.can_transition_to(target) {
            return false;
        }
        self.state = target;
        true
    }
}

// ── Send outcome ────────────────────────────────────────────────────

/// Result of one dispatch attempt, consumed once by the finalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum SendOutcome {
    Delivered,
    /// The server or message builder refused the message.
    Rejected(String),
    /// Connection, TLS or IO failure before the server answered.
    TransportError(String),
}

// ── Loop events ─────────────────────────────────────────────────────

/// Events delivered to the pipeline task by timers and send tasks.
#[derive(Debug)]
pub enum PipelineEvent {
    /// Settle delay elapsed for a path.
    Settled(PathBuf),
    /// The mailer finished with a path.
    SendFinished { path: PathBuf, outcome: SendOutcome },
}

// ── Observable events ───────────────────────────────────────────────

/// Transition and failure events broadcast by the pipeline.
///
/// Each event mirrors a log line; subscribers (tests, status consumers) get
/// the structured form instead of console text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    Discovered { id: Uuid, path: PathBuf },
    Settling { id: Uuid, path: PathBuf },
    /// File disappeared before it could be sent. Not an error.
    Dropped { path: PathBuf },
    InvalidTrigger { id: Uuid, path: PathBuf },
    ReadFailed { id: Uuid, path: PathBuf, reason: String },
    Sending { id: Uuid, path: PathBuf, recipient: String },
    Delivered { id: Uuid, path: PathBuf },
    CleanupFailed { id: Uuid, path: PathBuf, reason: String },
    SendFailed { id: Uuid, path: PathBuf, outcome: SendOutcome },
}

// ── File fingerprint ────────────────────────────────────────────────

/// Size and modification time of a trigger file.
///
/// Files that end a request while still on disk are remembered with their
/// fingerprint; scans ignore them until the fingerprint changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFingerprint {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl FileFingerprint {
    /// Read the fingerprint of `path`, or `None` if it cannot be stat'ed.
    pub fn of(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        Some(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}
