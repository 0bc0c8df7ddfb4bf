//! Typed document storage under a content root.

use std::fs;
use std::path::{Path, PathBuf};

use tmlsync_content::{is_guid, ContentDocument, ContentType, DocumentError};

use crate::mapping::GuidMappingStore;
use crate::runlog::{RunKind, RunLog};
use crate::{sanitize_path_component, write_atomic, StorageError};

pub const FS_MARKER: &str = ".fs-marker";
pub const DOCUMENT_EXTENSION: &str = "doc";

const MAPPINGS_DIR: &str = "mappings";
const LOGS_DIR: &str = "logs";

/// Parsed `<guid>.<content_type>.<ext>` filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentFileName {
    pub guid: String,
    pub content_type: ContentType,
    pub extension: String,
}

impl DocumentFileName {
    pub fn new(guid: &str, content_type: ContentType) -> Self {
        Self {
            guid: guid.to_string(),
            content_type,
            extension: DOCUMENT_EXTENSION.to_string(),
        }
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let mut parts = file_name.splitn(3, '.');
        let guid = parts.next()?;
        let content_type = parts.next()?.parse::<ContentType>().ok()?;
        let extension = parts.next()?;
        if !is_guid(guid) || extension.is_empty() {
            return None;
        }
        Some(Self {
            guid: guid.to_string(),
            content_type,
            extension: extension.to_string(),
        })
    }

    pub fn render(&self) -> String {
        format!("{}.{}.{}", self.guid, self.content_type, self.extension)
    }
}

/// Owns one content root.
#[derive(Debug, Clone)]
pub struct ContentFilesystem {
    root: PathBuf,
}

impl ContentFilesystem {
    /// Create the root (if absent) and its layout.
    ///
    /// Idempotent; fails with `InvalidRoot` when `root` exists but is not a
    /// directory.
    pub fn initialize(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        if root.exists() && !root.is_dir() {
            return Err(StorageError::InvalidRoot { path: root });
        }
        let fs = Self { root };
        fs.ensure_layout()?;
        Ok(fs)
    }

    /// Open an existing root; fails with `InvalidRoot` when it is missing.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(StorageError::InvalidRoot {
                path: root.to_path_buf(),
            });
        }
        Self::initialize(root)
    }

    fn ensure_layout(&self) -> Result<(), StorageError> {
        let mut dirs: Vec<PathBuf> = ContentType::ALL
            .into_iter()
            .map(|t| self.type_dir(t))
            .collect();
        dirs.push(self.mappings_dir());
        dirs.push(self.logs_dir());
        for dir in dirs {
            fs::create_dir_all(&dir).map_err(|source| StorageError::Write { path: dir, source })?;
        }

        let marker = self.root.join(FS_MARKER);
        if !marker.exists() {
            fs::write(&marker, "tmlsync content filesystem\n")
                .map_err(|source| StorageError::Write { path: marker, source })?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn type_dir(&self, content_type: ContentType) -> PathBuf {
        self.root.join(content_type.as_str())
    }

    pub fn mappings_dir(&self) -> PathBuf {
        self.root.join(MAPPINGS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    pub fn document_path(&self, content_type: ContentType, guid: &str) -> PathBuf {
        self.type_dir(content_type)
            .join(DocumentFileName::new(guid, content_type).render())
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Persist `document` under `{type}/{guid}.{type}.doc`.
    pub fn write(&self, document: &ContentDocument) -> Result<PathBuf, StorageError> {
        let guid = document.guid().ok_or_else(|| StorageError::MissingGuid {
            content_type: document.content_type(),
            name: document.display_name().to_string(),
        })?;
        let path = self.document_path(document.content_type(), guid);
        let text = document
            .to_pretty_string()
            .map_err(|source| StorageError::Document {
                path: path.clone(),
                source,
            })?;
        write_atomic(&path, text.as_bytes()).map_err(|source| StorageError::Write {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "wrote document");
        Ok(path)
    }

    /// Lazily load every document of the given types.
    ///
    /// Directory listings are taken per type up front; each document is read
    /// and parsed only when the iterator reaches it.
    pub fn load_all(
        &self,
        types: &[ContentType],
    ) -> impl Iterator<Item = Result<ContentDocument, StorageError>> + '_ {
        let types = types.to_vec();
        types
            .into_iter()
            .flat_map(move |t| self.document_files(t))
            .map(move |entry| entry.and_then(|(path, name)| self.read_document(&path, &name)))
    }

    /// Find a document by GUID across every type directory.
    pub fn load_one(&self, guid: &str) -> Result<ContentDocument, StorageError> {
        for content_type in ContentType::ALL {
            for entry in self.document_files(content_type) {
                let (path, name) = entry?;
                if name.guid.eq_ignore_ascii_case(guid) {
                    return self.read_document(&path, &name);
                }
            }
        }
        Err(StorageError::NotFound {
            guid: guid.to_string(),
            root: self.root.clone(),
        })
    }

    fn document_files(
        &self,
        content_type: ContentType,
    ) -> Vec<Result<(PathBuf, DocumentFileName), StorageError>> {
        let dir = self.type_dir(content_type);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(source) => return vec![Err(StorageError::Read { path: dir, source })],
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(source) => {
                    files.push(Err(StorageError::Read {
                        path: dir.clone(),
                        source,
                    }));
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            match DocumentFileName::parse(&file_name) {
                Some(name) if name.content_type == content_type => files.push(Ok((path, name))),
                Some(name) => tracing::warn!(
                    path = %path.display(),
                    expected = %content_type,
                    found = %name.content_type,
                    "skipping document stored under the wrong type directory"
                ),
                None => tracing::warn!(
                    path = %path.display(),
                    "skipping file that does not match <guid>.<type>.<ext>"
                ),
            }
        }
        files.sort_by(|a, b| match (a, b) {
            (Ok((pa, _)), Ok((pb, _))) => pa.cmp(pb),
            (Err(_), Ok(_)) => std::cmp::Ordering::Less,
            (Ok(_), Err(_)) => std::cmp::Ordering::Greater,
            (Err(_), Err(_)) => std::cmp::Ordering::Equal,
        });
        files
    }

    fn read_document(
        &self,
        path: &Path,
        name: &DocumentFileName,
    ) -> Result<ContentDocument, StorageError> {
        let text = fs::read_to_string(path).map_err(|source| StorageError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let to_err = |source: DocumentError| StorageError::Document {
            path: path.to_path_buf(),
            source,
        };
        let body = serde_json::from_str(&text).map_err(|e| to_err(DocumentError::from(e)))?;
        let mut document = ContentDocument::from_value_as(name.content_type, body).map_err(to_err)?;

        match document.guid() {
            None => document.set_guid(&name.guid).map_err(to_err)?,
            Some(guid) if !guid.eq_ignore_ascii_case(&name.guid) => tracing::warn!(
                path = %path.display(),
                document_guid = guid,
                "document guid differs from its filename; keeping the document's own guid"
            ),
            Some(_) => {}
        }
        Ok(document)
    }

    // ========================================================================
    // Logs and mappings
    // ========================================================================

    /// Start a run log under `logs/`.
    pub fn begin_run(&self, kind: RunKind) -> RunLog {
        RunLog::begin(&self.logs_dir(), kind)
    }

    pub fn mapping_path(&self, source_env: &str, dest_env: &str) -> PathBuf {
        self.mappings_dir().join(format!(
            "{}-{}.json",
            sanitize_path_component(source_env),
            sanitize_path_component(dest_env)
        ))
    }

    /// Default CSV export of a mapping: same sanitized stem, `.csv` extension.
    pub fn mapping_csv_path(&self, source_env: &str, dest_env: &str) -> PathBuf {
        self.mapping_path(source_env, dest_env).with_extension("csv")
    }

    /// Load the mapping store for an environment pair, materializing an empty
    /// file when none exists yet.
    pub fn get_or_create_mapping(
        &self,
        source_env: &str,
        dest_env: &str,
    ) -> Result<GuidMappingStore, StorageError> {
        let path = self.mapping_path(source_env, dest_env);
        let existed = path.exists();
        let mut store = GuidMappingStore::load(&path, source_env, dest_env)?;
        if !existed {
            store.persist()?;
        }
        Ok(store)
    }
}
