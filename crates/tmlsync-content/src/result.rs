//! Per-object migration outcomes.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::content_type::ContentType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MigrationStatus {
    Ok,
    Warning,
    Error,
}

impl MigrationStatus {
    /// Map a remote status code; anything unrecognised counts as an error.
    pub fn from_remote(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "OK" | "SUCCESS" => MigrationStatus::Ok,
            "WARNING" => MigrationStatus::Warning,
            _ => MigrationStatus::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationStatus::Ok => "OK",
            MigrationStatus::Warning => "WARNING",
            MigrationStatus::Error => "ERROR",
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, MigrationStatus::Error)
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one attempted object.
///
/// For imports `guid` is the remote-assigned GUID on success and the
/// document's original GUID on error; for exports it is the exported GUID.
/// An `Error` result never has an artifact behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationResult {
    pub guid: String,
    pub content_type: ContentType,
    pub display_name: String,
    pub status: MigrationStatus,
    pub messages: Vec<String>,
}

impl MigrationResult {
    pub fn new(
        guid: impl Into<String>,
        content_type: ContentType,
        display_name: impl Into<String>,
        status: MigrationStatus,
    ) -> Self {
        Self {
            guid: guid.into(),
            content_type,
            display_name: display_name.into(),
            status,
            messages: Vec::new(),
        }
    }

    pub fn error(
        guid: impl Into<String>,
        content_type: ContentType,
        display_name: impl Into<String>,
        message: impl AsRef<str>,
    ) -> Self {
        Self::new(guid, content_type, display_name, MigrationStatus::Error)
            .with_messages(message.as_ref())
    }

    /// Append the fragments of a raw remote message.
    pub fn with_messages(mut self, raw: &str) -> Self {
        self.messages.extend(split_messages(raw));
        self
    }

    pub fn is_error(&self) -> bool {
        self.status.is_error()
    }
}

fn message_break() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<br\s*/?>|\r?\n").expect("static regex"))
}

/// Split a remote diagnostic on line breaks and HTML `<br>` tags, dropping
/// empty fragments.
pub fn split_messages(raw: &str) -> Vec<String> {
    message_break()
        .split(raw)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
