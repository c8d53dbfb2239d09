//! Trigger file naming — `<recipient>.SendMail`.
//!
//! Pure string handling, no filesystem access. The recipient part is used
//! verbatim; malformed addresses are left for the transport to reject.

use std::fmt;

use crate::error::DispatchError;

/// Literal suffix that marks a file as a send request. Case-sensitive.
pub const TRIGGER_SUFFIX: &str = ".SendMail";

/// Recipient address derived from a trigger file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Recipient(String);

impl Recipient {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a basename carries the trigger suffix. Used as the scan filter.
pub fn is_trigger_name(file_name: &str) -> bool {
    file_name.ends_with(TRIGGER_SUFFIX)
}

/// Extract the recipient from a trigger file basename.
///
/// Rejects names without the suffix and names that are only the suffix.
pub fn parse_trigger_name(file_name: &str) -> Result<Recipient, DispatchError> {
    match file_name.strip_suffix(TRIGGER_SUFFIX) {
        Some(prefix) if !prefix.is_empty() => Ok(Recipient(prefix.to_string())),
        _ => Err(DispatchError::InvalidTrigger {
            file_name: file_name.to_string(),
        }),
    }
}
