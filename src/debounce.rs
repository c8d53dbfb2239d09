//! Per-file settle delay.
//!
//! A trigger file is left alone for a fixed interval after it is first seen
//! so the writer can finish. The window is anchored to first sighting:
//! scheduling an already pending path does nothing. Expiry re-checks that the
//! file is still on disk; a vanished file is dropped without a callback.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::pipeline::types::PipelineEvent;

/// Starts a one-shot timer for a path.
///
/// Implementations must eventually hand the path back to the owner (for the
/// pipeline, as `PipelineEvent::Settled`). They never touch the file.
pub trait Timer: Send + Sync {
    fn start(&self, delay: Duration, path: PathBuf) -> TimerHandle;
}

/// Handle to a started timer; aborting it stops the expiry from being delivered.
#[derive(Debug)]
pub struct TimerHandle(Option<JoinHandle<()>>);

impl TimerHandle {
    /// A handle with nothing to abort (manual timers in tests).
    pub fn detached() -> Self {
        Self(None)
    }

    fn abort(self) {
        if let Some(handle) = self.0 {
            handle.abort();
        }
    }
}

/// Tokio-backed timer that posts expiries onto the pipeline channel.
pub struct TokioTimer {
    events: mpsc::UnboundedSender<PipelineEvent>,
}

impl TokioTimer {
    pub fn new(events: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        Self { events }
    }
}

impl Timer for TokioTimer {
    fn start(&self, delay: Duration, path: PathBuf) -> TimerHandle {
        let events = self.events.clone();
        let deadline = tokio::time::Instant::now() + delay;
        TimerHandle(Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if events.send(PipelineEvent::Settled(path)).is_err() {
                debug!("Settle timer fired after pipeline shut down");
            }
        })))
    }
}

/// Settle-delay scheduler keyed by path.
pub struct TriggerDebouncer {
    delay: Duration,
    timer: Arc<dyn Timer>,
    pending: HashMap<PathBuf, TimerHandle>,
}

impl TriggerDebouncer {
    pub fn new(delay: Duration, timer: Arc<dyn Timer>) -> Self {
        Self {
            delay,
            timer,
            pending: HashMap::new(),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Start the settle timer for `path` unless one is already pending.
    ///
    /// Returns `true` if a new timer was started.
    pub fn schedule(&mut self, path: &Path) -> bool {
        if self.pending.contains_key(path) {
            debug!(path = %path.display(), "Settle timer already pending");
            return false;
        }
        let handle = self.timer.start(self.delay, path.to_path_buf());
        self.pending.insert(path.to_path_buf(), handle);
        true
    }

    /// Handle a timer expiry for `path`.
    ///
    /// Returns the path when the owner should process it: the path was
    /// pending and the file still exists right now.
    pub fn expire(&mut self, path: &Path) -> Option<PathBuf> {
        let (path, _handle) = self.pending.remove_entry(path)?;
        if path.exists() {
            Some(path)
        } else {
            debug!(path = %path.display(), "Trigger file vanished before settling");
            None
        }
    }

    pub fn is_pending(&self, path: &Path) -> bool {
        self.pending.contains_key(path)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Abort every outstanding timer.
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
    }
}
