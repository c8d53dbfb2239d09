//! Directory change notifications.
//!
//! Wraps `notify`'s recommended watcher for a single, non-recursive
//! directory. Raw events are collapsed into unit "directory changed"
//! notifications; the pipeline rescans on each one, so losing detail (or an
//! entire burst) is harmless as long as one notification gets through.

use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::WatchError;

/// Capacity of the notification channel. A full channel already holds a
/// pending rescan, so further notifications are dropped.
const NOTIFY_CAPACITY: usize = 1;

/// Live watch on one directory. Dropping it stops notifications.
pub struct DirectoryWatcher {
    dir: PathBuf,
    _watcher: RecommendedWatcher,
}

impl DirectoryWatcher {
    /// Start watching `dir`.
    ///
    /// Returns the watcher and the receiving end of the change channel. The
    /// channel closes once the watcher is dropped.
    pub fn start(dir: &Path) -> Result<(Self, mpsc::Receiver<()>), WatchError> {
        if !dir.is_dir() {
            return Err(WatchError::MissingDirectory(dir.to_path_buf()));
        }

        let (tx, rx) = mpsc::channel(NOTIFY_CAPACITY);
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            match event {
                Ok(event) if is_relevant(&event.kind) => {
                    if tx.try_send(()).is_err() {
                        debug!("Directory change coalesced into pending rescan");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Watch backend error"),
            }
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        info!(dir = %dir.display(), "Monitoring directory");

        Ok((
            Self {
                dir: dir.to_path_buf(),
                _watcher: watcher,
            },
            rx,
        ))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Events that can add, change or remove a trigger file.
fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}
