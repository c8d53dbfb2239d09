//! Dispatch pipeline — owns the in-flight set and drives each trigger file
//! through its state machine.
//!
//! All state lives on the task that calls [`DispatchPipeline::run`]. Timers
//! and sends run as spawned tasks whose only effect is posting a
//! [`PipelineEvent`] back onto the pipeline channel.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::debounce::{Timer, TokioTimer, TriggerDebouncer};
use crate::error::DispatchError;
use crate::mailer::Mailer;
use crate::pipeline::types::{
    DispatchEvent, FileFingerprint, PipelineEvent, RequestState, SendOutcome, WatchRequest,
};
use crate::trigger::{is_trigger_name, parse_trigger_name};

/// Default broadcast channel capacity for dispatch events.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Appended to a delivered trigger file before it is deleted, so a failed
/// delete leaves a name that no longer matches the trigger suffix.
const SENT_SUFFIX: &str = ".sent";

/// Removes a delivered trigger file from the watch directory.
type RemoveTrigger = fn(&Path) -> std::io::Result<()>;

/// File-trigger dispatch pipeline.
pub struct DispatchPipeline {
    watch_dir: PathBuf,
    subject: String,
    mailer: Arc<dyn Mailer>,
    debouncer: TriggerDebouncer,
    /// One entry per trigger file between discovery and a terminal state.
    in_flight: HashMap<PathBuf, WatchRequest>,
    /// Files that ended a request while still on disk. Skipped by scans
    /// until they are rewritten or removed.
    parked: HashMap<PathBuf, FileFingerprint>,
    remove_trigger: RemoveTrigger,
    events_tx: mpsc::UnboundedSender<PipelineEvent>,
    events_rx: mpsc::UnboundedReceiver<PipelineEvent>,
    activity_tx: broadcast::Sender<DispatchEvent>,
}

impl DispatchPipeline {
    /// Create a pipeline with tokio settle timers.
    pub fn new(config: WatchConfig, mailer: Arc<dyn Mailer>) -> Self {
        Self::with_timer(config, mailer, |events| {
            Arc::new(TokioTimer::new(events)) as Arc<dyn Timer>
        })
    }

    /// Create a pipeline with a custom settle timer.
    ///
    /// `make_timer` receives the pipeline's event sender; the timer must post
    /// `PipelineEvent::Settled` on it when a delay elapses.
    pub fn with_timer<F>(config: WatchConfig, mailer: Arc<dyn Mailer>, make_timer: F) -> Self
    where
        F: FnOnce(mpsc::UnboundedSender<PipelineEvent>) -> Arc<dyn Timer>,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (activity_tx, _rx) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        let timer = make_timer(events_tx.clone());
        let watch_dir =
            std::path::absolute(&config.watch_dir).unwrap_or_else(|_| config.watch_dir.clone());

        Self {
            watch_dir,
            subject: config.subject,
            mailer,
            debouncer: TriggerDebouncer::new(config.settle_delay, timer),
            in_flight: HashMap::new(),
            parked: HashMap::new(),
            remove_trigger: remove_trigger_file,
            events_tx,
            events_rx,
            activity_tx,
        }
    }

    /// Replace the cleanup step run after a delivery.
    #[cfg(test)]
    pub(crate) fn with_remover(mut self, remove: RemoveTrigger) -> Self {
        self.remove_trigger = remove;
        self
    }

    /// Subscribe to transition and failure events.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.activity_tx.subscribe()
    }

    pub fn watch_dir(&self) -> &Path {
        &self.watch_dir
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Current state of the request for `path`, if one is in flight.
    pub fn state_of(&self, path: &Path) -> Option<RequestState> {
        self.in_flight.get(path).map(|r| r.state)
    }

    pub fn is_parked(&self, path: &Path) -> bool {
        self.parked.contains_key(path)
    }

    /// Run until the change channel closes.
    ///
    /// Performs an initial sweep, then rescans on every change notification
    /// while servicing settle timers and send outcomes.
    pub async fn run(mut self, mut changes: mpsc::Receiver<()>) {
        info!(
            dir = %self.watch_dir.display(),
            settle_ms = self.debouncer.delay().as_millis() as u64,
            "Dispatch pipeline started"
        );

        self.scan();

        loop {
            tokio::select! {
                change = changes.recv() => match change {
                    Some(()) => {
                        self.scan();
                    }
                    None => {
                        info!("Change notifications closed, pipeline shutting down");
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                }
            }
        }

        self.debouncer.cancel_all();
    }

    /// Wait for and handle exactly one timer or send event.
    pub async fn step(&mut self) -> bool {
        match self.events_rx.recv().await {
            Some(event) => {
                self.handle_event(event).await;
                true
            }
            None => false,
        }
    }

    pub async fn handle_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Settled(path) => match self.debouncer.expire(&path) {
                Some(path) => self.process(path).await,
                None => self.drop_settling(&path),
            },
            PipelineEvent::SendFinished { path, outcome } => self.finalize(&path, outcome),
        }
    }

    /// List the watch directory and start a request for every new trigger file.
    ///
    /// Returns the number of requests started. Paths already in flight, and
    /// parked files that have not changed, are skipped.
    pub fn scan(&mut self) -> usize {
        let entries = match std::fs::read_dir(&self.watch_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.watch_dir.display(), error = %e, "Failed to list watch directory");
                return 0;
            }
        };

        let mut present = HashSet::new();
        let mut started = 0;

        for entry in entries.flatten() {
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            if !is_trigger_name(&file_name) {
                continue;
            }
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            present.insert(path.clone());

            if self.in_flight.contains_key(&path) {
                continue;
            }
            if let Some(parked) = self.parked.get(&path) {
                if FileFingerprint::of(&path).as_ref() == Some(parked) {
                    continue;
                }
                debug!(path = %path.display(), "Parked trigger file changed, rediscovering");
                self.parked.remove(&path);
            }

            self.discover(path, file_name);
            started += 1;
        }

        self.parked.retain(|path, _| present.contains(path));
        started
    }

    fn discover(&mut self, path: PathBuf, file_name: String) {
        let mut request = WatchRequest::new(path.clone(), file_name);
        info!(id = %request.id, file = %request.file_name, "Trigger file discovered");
        self.emit(DispatchEvent::Discovered {
            id: request.id,
            path: path.clone(),
        });

        self.debouncer.schedule(&path);
        request.transition_to(RequestState::Settling);
        self.emit(DispatchEvent::Settling {
            id: request.id,
            path: path.clone(),
        });

        self.in_flight.insert(path, request);
    }

    /// The settle timer fired but the file is gone.
    fn drop_settling(&mut self, path: &Path) {
        let settling = self
            .in_flight
            .get(path)
            .is_some_and(|r| r.state == RequestState::Settling);
        if !settling {
            return;
        }
        self.in_flight.remove(path);
        debug!(path = %path.display(), "Trigger file vanished before settling, dropped");
        self.emit(DispatchEvent::Dropped {
            path: path.to_path_buf(),
        });
    }

    /// Settle delay elapsed and the file still exists.
    async fn process(&mut self, path: PathBuf) {
        let Some(request) = self.in_flight.get_mut(&path) else {
            return;
        };
        if !request.transition_to(RequestState::Sending) {
            warn!(id = %request.id, state = %request.state, "Settled request in unexpected state");
            return;
        }
        let id = request.id;
        request.fingerprint = FileFingerprint::of(&path);

        let recipient = match parse_trigger_name(&request.file_name) {
            Ok(r) => r,
            Err(e) => {
                warn!(id = %id, error = %e, "Trigger file left in place");
                self.emit(DispatchEvent::InvalidTrigger {
                    id,
                    path: path.clone(),
                });
                self.fail(&path);
                return;
            }
        };

        let body = match tokio::fs::read(&path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let err = DispatchError::FileVanished { path: path.clone() };
                debug!(id = %id, "{err}");
                self.in_flight.remove(&path);
                self.emit(DispatchEvent::Dropped { path });
                return;
            }
            Err(source) => {
                let err = DispatchError::ReadFailure {
                    path: path.clone(),
                    source,
                };
                warn!(id = %id, error = %err, "Trigger file left in place");
                self.emit(DispatchEvent::ReadFailed {
                    id,
                    path: path.clone(),
                    reason: err.to_string(),
                });
                self.fail(&path);
                return;
            }
        };

        if let Some(request) = self.in_flight.get_mut(&path) {
            request.recipient = Some(recipient.clone());
            request.transition_to(RequestState::Finalizing);
        }

        info!(id = %id, to = %recipient, bytes = body.len(), "Sending email");
        self.emit(DispatchEvent::Sending {
            id,
            path: path.clone(),
            recipient: recipient.to_string(),
        });

        let mailer = Arc::clone(&self.mailer);
        let events = self.events_tx.clone();
        let subject = self.subject.clone();
        tokio::spawn(async move {
            let outcome = mailer.send(&recipient, &subject, &body).await;
            if events
                .send(PipelineEvent::SendFinished { path, outcome })
                .is_err()
            {
                debug!("Send finished after pipeline shut down");
            }
        });
    }

    /// Consume the send outcome for `path`.
    fn finalize(&mut self, path: &Path, outcome: SendOutcome) {
        let Some(mut request) = self.in_flight.remove(path) else {
            warn!(path = %path.display(), "Send outcome for untracked trigger file");
            return;
        };
        let id = request.id;

        match outcome {
            SendOutcome::Delivered => {
                request.transition_to(RequestState::Completed);
                let waited_ms = (Utc::now() - request.discovered_at).num_milliseconds();
                info!(id = %id, file = %request.file_name, waited_ms, "Email sent successfully");
                self.emit(DispatchEvent::Delivered {
                    id,
                    path: path.to_path_buf(),
                });

                match (self.remove_trigger)(path) {
                    Ok(()) => info!(id = %id, file = %request.file_name, "Processed and deleted file"),
                    Err(source) => {
                        let err = DispatchError::CleanupFailure {
                            path: path.to_path_buf(),
                            source,
                        };
                        warn!(id = %id, error = %err, "Message was sent, trigger file not removed");
                        self.emit(DispatchEvent::CleanupFailed {
                            id,
                            path: path.to_path_buf(),
                            reason: err.to_string(),
                        });
                        self.park(path, request.fingerprint);
                    }
                }
            }
            SendOutcome::Rejected(ref reason) | SendOutcome::TransportError(ref reason) => {
                request.transition_to(RequestState::Failed);
                let err = DispatchError::TransportRejected {
                    recipient: request
                        .recipient
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                    reason: reason.clone(),
                };
                warn!(id = %id, file = %request.file_name, error = %err, "Failed to send email");
                self.emit(DispatchEvent::SendFailed {
                    id,
                    path: path.to_path_buf(),
                    outcome,
                });
                self.park(path, request.fingerprint);
            }
        }
        debug_assert!(request.state.is_terminal(), "finalized in {}", request.state);
    }

    /// End a request in `Failed` and leave the file where it is.
    fn fail(&mut self, path: &Path) {
        let Some(mut request) = self.in_flight.remove(path) else {
            return;
        };
        request.transition_to(RequestState::Failed);
        debug_assert!(request.state.is_terminal(), "failed in {}", request.state);
        debug!(id = %request.id, state = %request.state, "Request finished");
        self.park(path, request.fingerprint);
    }

    /// Skip `path` on later scans until it no longer matches `fingerprint`.
    fn park(&mut self, path: &Path, fingerprint: Option<FileFingerprint>) {
        if !path.is_file() {
            return;
        }
        if let Some(fingerprint) = fingerprint.or_else(|| FileFingerprint::of(path)) {
            self.parked.insert(path.to_path_buf(), fingerprint);
        }
    }

    fn emit(&self, event: DispatchEvent) {
        // Ok if nobody is subscribed
        let _ = self.activity_tx.send(event);
    }
}

/// Remove a delivered trigger file.
///
/// The file is first renamed out of the trigger namespace so that a failing
/// delete cannot cause a second send. If the rename fails, delete in place.
fn remove_trigger_file(path: &Path) -> std::io::Result<()> {
    let mut sent = path.as_os_str().to_owned();
    sent.push(SENT_SUFFIX);
    let sent = PathBuf::from(sent);

    match std::fs::rename(path, &sent) {
        Ok(()) => std::fs::remove_file(&sent),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Rename before delete failed");
            std::fs::remove_file(path)
        }
    }
}
