//! maildrop — turn files dropped into a directory into sent emails.

pub mod config;
pub mod debounce;
pub mod error;
pub mod mailer;
pub mod pipeline;
pub mod trigger;
pub mod watcher;
