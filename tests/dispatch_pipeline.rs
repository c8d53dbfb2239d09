//! Integration tests for the dispatch pipeline.
//!
//! Every test runs on tokio's paused clock, so settle delays elapse as soon
//! as the runtime is idle. Each test uses its own temp directory and a
//! scripted mailer (no real SMTP).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, timeout};

use maildrop::config::WatchConfig;
use maildrop::mailer::Mailer;
use maildrop::pipeline::{DispatchEvent, DispatchPipeline, RequestState, SendOutcome};
use maildrop::trigger::Recipient;

const SETTLE: Duration = Duration::from_millis(2000);

/// Maximum virtual time to wait for an event that is not supposed to happen.
const QUIET_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
struct SentMail {
    to: String,
    subject: String,
    body: String,
}

/// Mailer that records each call and answers with a fixed outcome.
struct ScriptedMailer {
    outcome: SendOutcome,
    sent: Mutex<Vec<SentMail>>,
    /// Delete the trigger file while "sending", to provoke a cleanup failure.
    delete_during_send: Option<PathBuf>,
    /// Overwrite a trigger file while "sending", as a user fixing it would.
    rewrite_during_send: Option<(PathBuf, &'static str)>,
}

impl ScriptedMailer {
    fn new(outcome: SendOutcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            sent: Mutex::new(Vec::new()),
            delete_during_send: None,
            rewrite_during_send: None,
        })
    }

    fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for ScriptedMailer {
    async fn send(&self, to: &Recipient, subject: &str, body: &str) -> SendOutcome {
        self.sent.lock().unwrap().push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        if let Some(path) = &self.delete_during_send {
            std::fs::remove_file(path).unwrap();
        }
        if let Some((path, content)) = &self.rewrite_during_send {
            std::fs::write(path, content).unwrap();
        }
        self.outcome.clone()
    }
}

fn pipeline(dir: &Path, mailer: &Arc<ScriptedMailer>) -> DispatchPipeline {
    DispatchPipeline::new(
        WatchConfig::new(dir).with_settle_delay(SETTLE),
        Arc::clone(mailer) as Arc<dyn Mailer>,
    )
}

fn drain(rx: &mut broadcast::Receiver<DispatchEvent>) -> Vec<DispatchEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Assert that no further timer or send event arrives.
async fn assert_quiet(pipeline: &mut DispatchPipeline) {
    let waited = timeout(QUIET_PERIOD, pipeline.step()).await;
    assert!(waited.is_err(), "unexpected pipeline event");
}

// ── Scenario: delivery ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn delivered_file_is_sent_after_settle_and_removed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alice@example.com.SendMail");
    std::fs::write(&path, "Hello").unwrap();

    let mailer = ScriptedMailer::new(SendOutcome::Delivered);
    let mut pipeline = pipeline(dir.path(), &mailer);
    let mut events = pipeline.subscribe();

    let started = Instant::now();
    assert_eq!(pipeline.scan(), 1);

    // Settle timer
    assert!(pipeline.step().await);
    assert!(started.elapsed() >= SETTLE);
    assert_eq!(pipeline.state_of(&path), Some(RequestState::Finalizing));

    // Send outcome
    assert!(pipeline.step().await);

    assert_eq!(
        mailer.sent(),
        vec![SentMail {
            to: "alice@example.com".into(),
            subject: "New Message from SendMail".into(),
            body: "Hello".into(),
        }]
    );
    assert!(!path.exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    assert_eq!(pipeline.in_flight_count(), 0);

    let kinds: Vec<_> = drain(&mut events)
        .into_iter()
        .map(|e| match e {
            DispatchEvent::Discovered { .. } => "discovered",
            DispatchEvent::Settling { .. } => "settling",
            DispatchEvent::Sending { .. } => "sending",
            DispatchEvent::Delivered { .. } => "delivered",
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(kinds, vec!["discovered", "settling", "sending", "delivered"]);
}

#[tokio::test(start_paused = true)]
async fn body_is_file_content_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let content = "Zeile 1\r\nGrüße\n\n  trailing  \n";
    std::fs::write(dir.path().join("bob@example.com.SendMail"), content).unwrap();

    let mailer = ScriptedMailer::new(SendOutcome::Delivered);
    let mut pipeline = pipeline(dir.path(), &mailer);
    pipeline.scan();
    pipeline.step().await;
    pipeline.step().await;

    assert_eq!(mailer.sent()[0].body, content);
}

// ── Scenario: invalid trigger name ──────────────────────────────────

#[tokio::test(start_paused = true)]
async fn suffix_only_name_is_never_sent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".SendMail");
    std::fs::write(&path, "who am I").unwrap();

    let mailer = ScriptedMailer::new(SendOutcome::Delivered);
    let mut pipeline = pipeline(dir.path(), &mailer);
    let mut events = pipeline.subscribe();

    assert_eq!(pipeline.scan(), 1);
    pipeline.step().await;

    assert!(mailer.sent().is_empty());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "who am I");
    assert_eq!(pipeline.in_flight_count(), 0);
    assert!(
        drain(&mut events)
            .iter()
            .any(|e| matches!(e, DispatchEvent::InvalidTrigger { .. }))
    );

    // Not retried on later scans
    assert_eq!(pipeline.scan(), 0);
    assert_quiet(&mut pipeline).await;
}

// ── Scenario: file vanishes while settling ──────────────────────────

#[tokio::test(start_paused = true)]
async fn file_deleted_during_settle_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bob.SendMail");
    std::fs::write(&path, "draft").unwrap();

    let mailer = ScriptedMailer::new(SendOutcome::Delivered);
    let mut pipeline = pipeline(dir.path(), &mailer);
    let mut events = pipeline.subscribe();

    pipeline.scan();
    std::fs::remove_file(&path).unwrap();
    pipeline.step().await;

    assert!(mailer.sent().is_empty());
    assert_eq!(pipeline.in_flight_count(), 0);
    assert!(
        drain(&mut events)
            .iter()
            .any(|e| matches!(e, DispatchEvent::Dropped { path: p } if *p == path))
    );
    assert_quiet(&mut pipeline).await;
}

// ── Scenario: repeated notifications while settling ─────────────────

#[tokio::test(start_paused = true)]
async fn rescans_while_settling_send_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("carol@example.com.SendMail");
    std::fs::write(&path, "Hi Carol").unwrap();

    let mailer = ScriptedMailer::new(SendOutcome::Delivered);
    let mut pipeline = pipeline(dir.path(), &mailer);

    assert_eq!(pipeline.scan(), 1);
    tokio::time::advance(Duration::from_millis(500)).await;
    assert_eq!(pipeline.scan(), 0);
    assert_eq!(pipeline.scan(), 0);
    assert_eq!(pipeline.in_flight_count(), 1);

    pipeline.step().await;
    pipeline.step().await;
    assert_quiet(&mut pipeline).await;

    assert_eq!(mailer.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn settle_window_is_anchored_to_first_sighting() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("erin@example.com.SendMail");
    std::fs::write(&path, "v1").unwrap();

    let mailer = ScriptedMailer::new(SendOutcome::Delivered);
    let mut pipeline = pipeline(dir.path(), &mailer);

    let started = Instant::now();
    pipeline.scan();
    tokio::time::advance(Duration::from_millis(1500)).await;
    std::fs::write(&path, "v2").unwrap();
    pipeline.scan();

    pipeline.step().await;
    let elapsed = started.elapsed();
    assert!(elapsed >= SETTLE);
    assert!(elapsed < SETTLE + Duration::from_millis(1500));

    pipeline.step().await;
    assert_eq!(mailer.sent()[0].body, "v2");
}

#[tokio::test(start_paused = true)]
async fn scan_during_send_does_not_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frank@example.com.SendMail");
    std::fs::write(&path, "x").unwrap();

    let mailer = ScriptedMailer::new(SendOutcome::Delivered);
    let mut pipeline = pipeline(dir.path(), &mailer);

    pipeline.scan();
    pipeline.step().await;
    assert_eq!(pipeline.state_of(&path), Some(RequestState::Finalizing));

    // The file is still on disk while the send is outstanding.
    assert_eq!(pipeline.scan(), 0);

    pipeline.step().await;
    assert_quiet(&mut pipeline).await;
    assert_eq!(mailer.sent().len(), 1);
}

// ── Scenario: transport rejection ───────────────────────────────────

#[tokio::test(start_paused = true)]
async fn rejected_file_stays_and_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dave.SendMail");
    std::fs::write(&path, "Hello Dave").unwrap();

    let mailer = ScriptedMailer::new(SendOutcome::Rejected("535 authentication failed".into()));
    let mut pipeline = pipeline(dir.path(), &mailer);
    let mut events = pipeline.subscribe();

    pipeline.scan();
    pipeline.step().await;
    pipeline.step().await;

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "Hello Dave");
    assert_eq!(pipeline.in_flight_count(), 0);
    assert!(pipeline.is_parked(&path));
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        DispatchEvent::SendFailed { outcome: SendOutcome::Rejected(reason), .. }
            if reason.contains("535")
    )));

    // An unrelated change does not re-attempt it.
    std::fs::write(dir.path().join("unrelated.txt"), "noise").unwrap();
    assert_eq!(pipeline.scan(), 0);
    assert_quiet(&mut pipeline).await;
    assert_eq!(mailer.sent().len(), 1);

    // Rewriting the file is a new discovery.
    std::fs::write(&path, "Hello Dave, second try").unwrap();
    assert_eq!(pipeline.scan(), 1);
    assert!(!pipeline.is_parked(&path));
    pipeline.step().await;
    pipeline.step().await;
    assert_eq!(mailer.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn file_rewritten_during_failed_send_is_attempted_again() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dave.SendMail");
    std::fs::write(&path, "v1").unwrap();

    let mailer = Arc::new(ScriptedMailer {
        outcome: SendOutcome::Rejected("550 mailbox unavailable".into()),
        sent: Mutex::new(Vec::new()),
        delete_during_send: None,
        rewrite_during_send: Some((path.clone(), "corrected, longer body")),
    });
    let mut pipeline = pipeline(dir.path(), &mailer);

    pipeline.scan();
    pipeline.step().await;
    pipeline.step().await;
    assert!(pipeline.is_parked(&path));

    // The rewrite landed after the body was read, so it counts as a change.
    assert_eq!(pipeline.scan(), 1);
    pipeline.step().await;
    pipeline.step().await;

    let bodies: Vec<_> = mailer.sent().into_iter().map(|m| m.body).collect();
    assert_eq!(bodies, vec!["v1", "corrected, longer body"]);
}

#[tokio::test(start_paused = true)]
async fn transport_error_leaves_file_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gina@example.com.SendMail");
    std::fs::write(&path, "body").unwrap();

    let mailer = ScriptedMailer::new(SendOutcome::TransportError("connection refused".into()));
    let mut pipeline = pipeline(dir.path(), &mailer);

    pipeline.scan();
    pipeline.step().await;
    pipeline.step().await;

    assert!(path.exists());
    assert_eq!(pipeline.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn parked_entry_forgotten_when_file_removed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hank.SendMail");
    std::fs::write(&path, "body").unwrap();

    let mailer = ScriptedMailer::new(SendOutcome::Rejected("550 no such user".into()));
    let mut pipeline = pipeline(dir.path(), &mailer);

    pipeline.scan();
    pipeline.step().await;
    pipeline.step().await;
    assert!(pipeline.is_parked(&path));

    std::fs::remove_file(&path).unwrap();
    pipeline.scan();
    assert!(!pipeline.is_parked(&path));
}

// ── Read and cleanup failures ───────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unreadable_trigger_is_not_sent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ivy@example.com.SendMail");
    std::fs::write(&path, "body").unwrap();

    let mailer = ScriptedMailer::new(SendOutcome::Delivered);
    let mut pipeline = pipeline(dir.path(), &mailer);
    let mut events = pipeline.subscribe();

    pipeline.scan();
    // Swap the file for a directory of the same name: it still exists at
    // settle time but cannot be read as a file.
    std::fs::remove_file(&path).unwrap();
    std::fs::create_dir(&path).unwrap();
    pipeline.step().await;

    assert!(mailer.sent().is_empty());
    assert!(path.is_dir());
    assert_eq!(pipeline.in_flight_count(), 0);
    assert!(
        drain(&mut events)
            .iter()
            .any(|e| matches!(e, DispatchEvent::ReadFailed { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn cleanup_failure_still_completes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jack@example.com.SendMail");
    std::fs::write(&path, "body").unwrap();

    let mailer = Arc::new(ScriptedMailer {
        outcome: SendOutcome::Delivered,
        sent: Mutex::new(Vec::new()),
        delete_during_send: Some(path.clone()),
        rewrite_during_send: None,
    });
    let mut pipeline = pipeline(dir.path(), &mailer);
    let mut events = pipeline.subscribe();

    pipeline.scan();
    pipeline.step().await;
    pipeline.step().await;

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(e, DispatchEvent::Delivered { .. })));
    assert!(events.iter().any(|e| matches!(e, DispatchEvent::CleanupFailed { .. })));
    assert_eq!(pipeline.in_flight_count(), 0);
    // Nothing left on disk to remember.
    assert!(!pipeline.is_parked(&path));
    assert_eq!(mailer.sent().len(), 1);
}

// ── Several files ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn independent_files_are_each_sent() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["a@example.com", "b@example.com", "c@example.com"] {
        std::fs::write(dir.path().join(format!("{name}.SendMail")), name).unwrap();
    }

    let mailer = ScriptedMailer::new(SendOutcome::Delivered);
    let mut pipeline = pipeline(dir.path(), &mailer);

    assert_eq!(pipeline.scan(), 3);
    for _ in 0..6 {
        pipeline.step().await;
    }

    let mut recipients: Vec<_> = mailer.sent().into_iter().map(|m| m.to).collect();
    recipients.sort();
    assert_eq!(recipients, vec!["a@example.com", "b@example.com", "c@example.com"]);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    assert_eq!(pipeline.in_flight_count(), 0);
}

// ── Event loop ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn run_sweeps_at_startup_and_on_change() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("first@example.com.SendMail"), "1").unwrap();

    let mailer = ScriptedMailer::new(SendOutcome::Delivered);
    let pipeline = pipeline(dir.path(), &mailer);
    let (changes_tx, changes_rx) = mpsc::channel(1);
    let run = tokio::spawn(pipeline.run(changes_rx));

    tokio::time::sleep(SETTLE * 2).await;
    assert_eq!(mailer.sent().len(), 1);

    std::fs::write(dir.path().join("second@example.com.SendMail"), "2").unwrap();
    changes_tx.send(()).await.unwrap();
    tokio::time::sleep(SETTLE * 2).await;
    assert_eq!(mailer.sent().len(), 2);

    drop(changes_tx);
    timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
