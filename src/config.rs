//! Configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default env file name, looked up next to the executable and then in the
/// working directory.
pub const ENV_FILE_NAME: &str = "SendMail.env";

/// Subject line used for every dispatched message.
pub const DEFAULT_SUBJECT: &str = "New Message from SendMail";

/// Default settle delay between first sighting of a trigger file and dispatch.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(2000);

const DEFAULT_SMTP_PORT: u16 = 587;

/// SMTP transport settings, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    /// Upgrade the connection with STARTTLS. When false the session is plain TCP.
    pub starttls: bool,
}

impl SmtpConfig {
    /// Build config from environment variables.
    ///
    /// `SMTP_SERVER` is required; everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = lookup("SMTP_SERVER")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("SMTP_SERVER".into()))?;

        let port = match lookup("SMTP_PORT") {
            Some(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: "SMTP_PORT".into(),
                message: format!("{raw:?}: {e}"),
            })?,
            None => DEFAULT_SMTP_PORT,
        };

        let username = lookup("SMTP_USERNAME").unwrap_or_default();
        let password = SecretString::from(lookup("SMTP_PASSWORD").unwrap_or_default());
        let from_address = lookup("SMTP_FROM")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| username.clone());

        let starttls = lookup("SMTP_STARTTLS")
            .map(|s| parse_flag(&s))
            .unwrap_or(true);

        Ok(Self {
            host,
            port,
            username,
            password,
            from_address,
            starttls,
        })
    }
}

/// Watch-side settings for the dispatch pipeline.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Directory scanned for trigger files.
    pub watch_dir: PathBuf,
    /// Time a trigger file is left alone after first sighting.
    pub settle_delay: Duration,
    /// Subject line for every dispatched message.
    pub subject: String,
}

impl WatchConfig {
    pub fn new(watch_dir: impl Into<PathBuf>) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            subject: DEFAULT_SUBJECT.to_string(),
        }
    }

    /// Build config from `WATCH_DIR` and `SETTLE_DELAY_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let watch_dir = lookup("WATCH_DIR")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| ".".to_string());

        let settle_delay = match lookup("SETTLE_DELAY_MS") {
            Some(raw) => Duration::from_millis(raw.trim().parse().map_err(|e| {
                ConfigError::InvalidValue {
                    key: "SETTLE_DELAY_MS".into(),
                    message: format!("{raw:?}: {e}"),
                }
            })?),
            None => DEFAULT_SETTLE_DELAY,
        };

        Ok(Self {
            settle_delay,
            ..Self::new(watch_dir)
        })
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }
}

/// Load the env file into the process environment.
///
/// An explicit path must exist. Without one, `SendMail.env` next to the
/// executable is preferred over `./SendMail.env`; a missing default file is
/// not an error. Variables already present in the environment win.
pub fn load_env_file(explicit: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
    if let Some(path) = explicit {
        dotenvy::from_path(path).map_err(|e| ConfigError::EnvFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        return Ok(Some(path.to_path_buf()));
    }

    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(ENV_FILE_NAME)));
    let candidates = beside_exe
        .into_iter()
        .chain(std::iter::once(PathBuf::from(ENV_FILE_NAME)));

    for candidate in candidates {
        if !candidate.is_file() {
            continue;
        }
        dotenvy::from_path(&candidate).map_err(|e| ConfigError::EnvFile {
            path: candidate.clone(),
            reason: e.to_string(),
        })?;
        return Ok(Some(candidate));
    }

    Ok(None)
}

fn parse_flag(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case("true")
}
