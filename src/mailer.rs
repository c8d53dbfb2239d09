//! Mail transport boundary.
//!
//! The pipeline only sees [`Mailer::send`]. `SmtpMailer` owns the SMTP
//! session: a fresh lettre transport per message, no pooling, no retries.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::config::SmtpConfig;
use crate::pipeline::types::SendOutcome;
use crate::trigger::Recipient;

/// Sends one message and reports the three-way outcome.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &Recipient, subject: &str, body: &str) -> SendOutcome;
}

/// SMTP mailer backed by lettre.
#[derive(Clone)]
pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        if config.starttls {
            info!(host = %config.host, port = config.port, "SMTP connection: STARTTLS enabled");
        } else {
            warn!(
                host = %config.host,
                port = config.port,
                "SMTP connection: plain TCP, credentials are sent unencrypted"
            );
        }
        Self { config }
    }

    fn build_message(&self, to: &str, subject: &str, body: &str) -> Result<Message, String> {
        let from: Mailbox = self
            .config
            .from_address
            .parse()
            .map_err(|e| format!("Invalid from address {:?}: {e}", self.config.from_address))?;
        let to: Mailbox = to
            .parse()
            .map_err(|e| format!("Invalid to address {to:?}: {e}"))?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| format!("Failed to build email: {e}"))
    }

    fn build_transport(&self) -> Result<SmtpTransport, lettre::transport::smtp::Error> {
        let builder = if self.config.starttls {
            SmtpTransport::starttls_relay(&self.config.host)?
        } else {
            SmtpTransport::builder_dangerous(&self.config.host)
        };

        let mut builder = builder.port(self.config.port);
        if !self.config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                self.config.username.clone(),
                self.config.password.expose_secret().to_string(),
            ));
        }
        Ok(builder.build())
    }

    /// Blocking send — run under `spawn_blocking`.
    fn send_blocking(&self, message: &Message) -> SendOutcome {
        let transport = match self.build_transport() {
            Ok(t) => t,
            Err(e) => return SendOutcome::TransportError(format!("SMTP relay error: {e}")),
        };

        debug!(host = %self.config.host, user = %self.config.username, "Connecting to SMTP server");

        match transport.send(message) {
            Ok(_) => SendOutcome::Delivered,
            Err(e) => classify_smtp_error(&e),
        }
    }
}

/// Map a lettre error to an outcome: anything the server answered with a
/// negative reply code is a rejection, everything else is transport trouble.
fn classify_smtp_error(err: &lettre::transport::smtp::Error) -> SendOutcome {
    if err.is_permanent() || err.is_transient() {
        SendOutcome::Rejected(format!("SMTP send failed: {err}"))
    } else {
        SendOutcome::TransportError(format!("SMTP send failed: {err}"))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &Recipient, subject: &str, body: &str) -> SendOutcome {
        info!(to = %to, "Preparing to send email");

        let message = match self.build_message(to.as_str(), subject, body) {
            Ok(m) => m,
            Err(reason) => return SendOutcome::Rejected(reason),
        };

        let mailer = self.clone();
        match tokio::task::spawn_blocking(move || mailer.send_blocking(&message)).await {
            Ok(outcome) => outcome,
            Err(e) => SendOutcome::TransportError(format!("SMTP send task panicked: {e}")),
        }
    }
}
