//! tmlsync content storage
//!
//! One directory root holds everything a migration needs between runs:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      CONTENT FILESYSTEM                             │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  root/                                                              │
//! │    .fs-marker                   existence sentinel                  │
//! │    connection/ table/ ...       <guid>.<type>.doc per document      │
//! │    mappings/<src>-<dst>.json    GUID mapping store per env pair     │
//! │    logs/<kind>-<ts>.log         human log, one per run              │
//! │    logs/<kind>-<ts>/            copies of exported/submitted docs   │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Features
//!
//! - **Typed**: documents live under the directory of their `ContentType`
//! - **Atomic**: documents and mapping files are written via temp + rename
//! - **Tolerant**: non-conforming filenames are skipped, not fatal
//! - **Best-effort logs**: run-log failures never abort the primary operation
//!
//! Access is single-writer per root; callers serialize concurrent runs.

pub mod filesystem;
pub mod mapping;
pub mod runlog;

#[cfg(test)]
mod tests;

use std::path::PathBuf;

use tmlsync_content::{ContentType, DocumentError};

pub use filesystem::{ContentFilesystem, DocumentFileName, DOCUMENT_EXTENSION, FS_MARKER};
pub use mapping::{GuidMappingStore, MappingPair, GENERATED_BY};
pub use runlog::{RunKind, RunLog};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("content root `{}` exists and is not a directory", .path.display())]
    InvalidRoot { path: PathBuf },

    #[error("failed to write `{}`: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read `{}`: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no document with guid `{guid}` under `{}`", .root.display())]
    NotFound { guid: String, root: PathBuf },

    #[error("failed to persist mapping `{}`: {source}", .path.display())]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("document `{}` is malformed: {source}", .path.display())]
    Document {
        path: PathBuf,
        source: DocumentError,
    },

    #[error("{content_type} `{name}` has no guid and cannot be stored by identity")]
    MissingGuid {
        content_type: ContentType,
        name: String,
    },

    #[error("mapping file `{}` is malformed: {source}", .path.display())]
    MappingFormat {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Write `bytes` to `path` through a temporary file in the same directory so
/// readers never observe a partial file.
pub(crate) fn write_atomic(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_data()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Replace anything outside `[A-Za-z0-9_-]` so an environment name is safe as
/// a filename component.
pub(crate) fn sanitize_path_component(s: &str) -> String {
    let out: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        "_".to_string()
    } else {
        out
    }
}
