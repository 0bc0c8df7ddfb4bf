//! Per-run operation logs.
//!
//! Every export or import run gets:
//! - `logs/<kind>-<ts>.log`: a human-readable, append-only log, and
//! - `logs/<kind>-<ts>/`: a copy of every document exported or submitted,
//!   named `<old-or-new-guid>.<type>.doc`.
//!
//! Logging is best-effort: failures are reported through `tracing` and never
//! surface to the caller.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{SecondsFormat, Utc};
use tmlsync_content::{ContentDocument, MigrationResult};

use crate::filesystem::DOCUMENT_EXTENSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Export,
    Import,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::Export => "export",
            RunKind::Import => "import",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct RunLog {
    kind: RunKind,
    log_path: PathBuf,
    documents_dir: PathBuf,
    sequence: AtomicU64,
}

impl RunLog {
    pub(crate) fn begin(logs_dir: &Path, kind: RunKind) -> RunLog {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S").to_string();
        let mut name = format!("{kind}-{stamp}");
        let mut n = 1;
        while logs_dir.join(format!("{name}.log")).exists() || logs_dir.join(&name).exists() {
            n += 1;
            name = format!("{kind}-{stamp}-{n}");
        }

        let log = RunLog {
            kind,
            log_path: logs_dir.join(format!("{name}.log")),
            documents_dir: logs_dir.join(&name),
            sequence: AtomicU64::new(0),
        };
        log.write_line(&format!(
            "# tmlsync {kind} run started {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        log
    }

    pub fn kind(&self) -> RunKind {
        self.kind
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn documents_dir(&self) -> &Path {
        &self.documents_dir
    }

    /// Record one document: a dated, sequence-numbered line in the run log
    /// plus a copy of the document. Never fails.
    ///
    /// The copy is named after `previous_guid` when given (imports keep the
    /// source-side GUID), else after the document's own GUID.
    pub fn append_log(&self, document: &ContentDocument, previous_guid: Option<&str>) -> u64 {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let stem = previous_guid
            .or(document.guid())
            .map(str::to_string)
            .unwrap_or_else(|| format!("unassigned-{seq:05}"));
        let file_name = format!(
            "{stem}.{}.{DOCUMENT_EXTENSION}",
            document.content_type()
        );

        let copy = fs::create_dir_all(&self.documents_dir)
            .and_then(|_| {
                let text = document
                    .to_pretty_string()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                fs::write(self.documents_dir.join(&file_name), text)
            });
        if let Err(err) = copy {
            tracing::warn!(
                run = %self.log_path.display(),
                file = %file_name,
                error = %err,
                "failed to copy document into run log"
            );
        }

        self.write_line(&format!(
            "{} #{seq:05} {:<10} guid={} previous={} name=\"{}\"",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            document.content_type().as_str(),
            document.guid().unwrap_or("-"),
            previous_guid.unwrap_or("-"),
            document.display_name()
        ));
        seq
    }

    /// Append the final results table to the run log.
    pub fn append_results(&self, results: &[MigrationResult]) {
        let mut text = String::from("# results\n");
        for r in results {
            text.push_str(&format!(
                "{:<7} {:<10} {:<36} {}",
                r.status.as_str(),
                r.content_type.as_str(),
                r.guid,
                r.display_name
            ));
            if !r.messages.is_empty() {
                text.push_str(" :: ");
                text.push_str(&r.messages.join(" | "));
            }
            text.push('\n');
        }
        self.write_line(text.trim_end());
    }

    pub fn note(&self, message: &str) {
        self.write_line(&format!(
            "{} {message}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        ));
    }

    fn write_line(&self, line: &str) {
        let result = self
            .log_path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| {
                let mut f = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.log_path)?;
                f.write_all(line.as_bytes())?;
                f.write_all(b"\n")
            });
        if let Err(err) = result {
            tracing::warn!(
                run = %self.log_path.display(),
                error = %err,
                "failed to append to run log"
            );
        }
    }
}
