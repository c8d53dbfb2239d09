//! Error types for maildrop.

use std::path::PathBuf;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load env file {path}: {reason}")]
    EnvFile { path: PathBuf, reason: String },
}

/// Directory watching errors.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Watch directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    #[error("Watch backend error: {0}")]
    Backend(#[from] notify::Error),
}

/// Per-file dispatch failures.
///
/// None of these are fatal: the pipeline logs them against the affected
/// trigger file and keeps servicing the rest of the directory.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid trigger name: {file_name}")]
    InvalidTrigger { file_name: String },

    #[error("Trigger file vanished: {}", path.display())]
    FileVanished { path: PathBuf },

    #[error("Failed to read trigger file {}: {source}", path.display())]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport rejected message to {recipient}: {reason}")]
    TransportRejected { recipient: String, reason: String },

    #[error("Delivered but failed to remove {}: {source}", path.display())]
    CleanupFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
