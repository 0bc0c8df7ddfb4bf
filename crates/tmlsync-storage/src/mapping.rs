//! Persistent GUID mapping between environments.
//!
//! Each row maps a canonicalized logical key (normally the object's GUID in
//! the environment it was first exported from) to at most one GUID per
//! environment name:
//!
//! ```json
//! {
//!   "generated-by": "tmlsync/0.1.0",
//!   "mapping": {
//!     "0a7c5a4e-...": { "dev": "0a7c5a4e-...", "prod": "9f31c0d2-..." }
//!   }
//! }
//! ```
//!
//! Writes are last-writer-wins per `(key, environment)`; rows are never
//! deleted by normal operation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{write_atomic, StorageError};

pub const GENERATED_BY: &str = concat!("tmlsync/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MappingFileV1 {
    #[serde(rename = "generated-by")]
    generated_by: String,
    #[serde(default)]
    mapping: BTreeMap<String, BTreeMap<String, String>>,
}

/// One `record` call, for `record_batch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingPair {
    pub logical_key: String,
    pub source_env: String,
    pub source_guid: String,
    pub dest_env: String,
    pub dest_guid: String,
}

#[derive(Debug, Clone)]
pub struct GuidMappingStore {
    path: PathBuf,
    source_env: String,
    dest_env: String,
    entries: BTreeMap<String, BTreeMap<String, String>>,
    dirty: bool,
}

impl GuidMappingStore {
    /// An empty, unsaved store bound to `path`.
    pub fn new(path: impl Into<PathBuf>, source_env: &str, dest_env: &str) -> Self {
        Self {
            path: path.into(),
            source_env: source_env.to_string(),
            dest_env: dest_env.to_string(),
            entries: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Read the store at `path`; an absent file yields an empty store.
    pub fn load(path: &Path, source_env: &str, dest_env: &str) -> Result<Self, StorageError> {
        let mut store = Self::new(path, source_env, dest_env);
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(store),
            Err(source) => {
                return Err(StorageError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let file: MappingFileV1 =
            serde_json::from_str(&text).map_err(|source| StorageError::MappingFormat {
                path: path.to_path_buf(),
                source,
            })?;

        // Older files may carry keys in mixed case; fold them on read.
        for (key, envs) in file.mapping {
            let row = store.entries.entry(Self::canonical_key(&key)).or_default();
            row.extend(envs);
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source_env(&self) -> &str {
        &self.source_env
    }

    pub fn dest_env(&self) -> &str {
        &self.dest_env
    }

    pub fn canonical_key(key: &str) -> String {
        key.trim().to_ascii_lowercase()
    }

    /// The GUID recorded for `env`, if any.
    pub fn lookup(&self, logical_key: &str, env: &str) -> Option<&str> {
        self.entries
            .get(&Self::canonical_key(logical_key))
            .and_then(|row| row.get(env))
            .map(String::as_str)
    }

    /// The GUID for `dest_env`, or `logical_key` unchanged when the object was
    /// never migrated there.
    pub fn resolve(&self, logical_key: &str, dest_env: &str) -> String {
        self.lookup(logical_key, dest_env)
            .unwrap_or(logical_key)
            .to_string()
    }

    /// Find the logical key whose `env` column holds `guid`.
    pub fn logical_key_for(&self, env: &str, guid: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, row)| row.get(env).is_some_and(|g| g.eq_ignore_ascii_case(guid)))
            .map(|(key, _)| key.as_str())
    }

    /// Record both sides of a migrated object, overwriting earlier values.
    pub fn record(
        &mut self,
        logical_key: &str,
        source_env: &str,
        source_guid: &str,
        dest_env: &str,
        dest_guid: &str,
    ) {
        let row = self
            .entries
            .entry(Self::canonical_key(logical_key))
            .or_default();
        row.insert(source_env.to_string(), source_guid.to_string());
        row.insert(dest_env.to_string(), dest_guid.to_string());
        self.dirty = true;
    }

    /// Apply `record` for each pair in order; earlier pairs stay applied even
    /// if a later one is never reached.
    pub fn record_batch(&mut self, pairs: impl IntoIterator<Item = MappingPair>) -> usize {
        let mut applied = 0;
        for pair in pairs {
            self.record(
                &pair.logical_key,
                &pair.source_env,
                &pair.source_guid,
                &pair.dest_env,
                &pair.dest_guid,
            );
            applied += 1;
        }
        applied
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, String>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when there are recorded changes not yet persisted.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Serialize to JSON (with the `generated-by` header) and replace the file
    /// atomically.
    pub fn persist(&mut self) -> Result<(), StorageError> {
        let file = MappingFileV1 {
            generated_by: GENERATED_BY.to_string(),
            mapping: self.entries.clone(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(|source| StorageError::MappingFormat {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, json.as_bytes()).map_err(|source| StorageError::Persist {
            path: self.path.clone(),
            source,
        })?;
        self.dirty = false;
        tracing::debug!(path = %self.path.display(), rows = self.entries.len(), "persisted guid mapping");
        Ok(())
    }
}
