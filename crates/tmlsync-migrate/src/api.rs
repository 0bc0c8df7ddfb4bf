//! The remote platform, as the engine sees it.
//!
//! `ContentApi` is the only seam between migration logic and the network.
//! The CLI ships a blocking REST implementation; tests use
//! `testing::FakeApi`. Implementations return `ApiError` for any non-2xx or
//! undecodable response and never retry on the engine's behalf.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tmlsync_content::{ContentDocument, ContentType, MetadataType, MigrationStatus};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{url} returned HTTP {status}: {body}")]
    Http {
        url: String,
        status: u16,
        body: String,
    },

    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("object `{guid}` does not exist")]
    NotFound { guid: String },
}

impl ApiError {
    /// Connection failures, throttling and server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport { .. } => true,
            ApiError::Http { status, .. } => *status == 429 || *status >= 500,
            ApiError::Decode { .. } | ApiError::NotFound { .. } => false,
        }
    }
}

// ============================================================================
// Listing
// ============================================================================

/// One row of the remote metadata listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHeader {
    pub guid: String,
    pub name: String,
    pub content_type: ContentType,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ContentHeader {
    pub fn metadata_type(&self) -> MetadataType {
        self.content_type.metadata_type()
    }
}

/// Criteria for `list_content`. Empty fields do not constrain.
///
/// `include_types`/`exclude_types` work at listing-kind granularity, where
/// tables, views and worksheets share `LOGICAL_TABLE`. `content_types` and
/// `exclude_content_types` tell those subtypes apart.
///
/// `name_pattern` uses the platform's `%` wildcard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentFilter {
    pub guids: Vec<String>,
    pub tags: Vec<String>,
    pub author: Option<String>,
    pub include_types: Vec<MetadataType>,
    pub exclude_types: Vec<MetadataType>,
    pub content_types: Vec<ContentType>,
    pub exclude_content_types: Vec<ContentType>,
    pub name_pattern: Option<String>,
}

impl ContentFilter {
    pub fn by_guids(guids: &[String], metadata_type: MetadataType) -> Self {
        Self {
            guids: guids.to_vec(),
            include_types: vec![metadata_type],
            ..Self::default()
        }
    }

    /// True when any criterion other than `guids` is set.
    pub fn has_criteria(&self) -> bool {
        !self.tags.is_empty()
            || self.author.is_some()
            || !self.include_types.is_empty()
            || !self.exclude_types.is_empty()
            || !self.content_types.is_empty()
            || !self.exclude_content_types.is_empty()
            || self.name_pattern.is_some()
    }

    /// Listing kinds to request from the backend: `include_types`, or the
    /// kinds behind `content_types` when only those are set.
    pub fn listing_kinds(&self) -> Vec<MetadataType> {
        if !self.include_types.is_empty() {
            return self.include_types.clone();
        }
        let mut kinds = Vec::new();
        for t in &self.content_types {
            let kind = t.metadata_type();
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        kinds
    }

    /// Append `types` to the exclusion list, skipping duplicates.
    pub fn exclude(&mut self, types: &[MetadataType]) {
        for t in types {
            if !self.exclude_types.contains(t) {
                self.exclude_types.push(*t);
            }
        }
    }

    /// Client-side evaluation of the filter, for implementations whose
    /// backend cannot express every criterion.
    pub fn matches(&self, header: &ContentHeader) -> bool {
        let mt = header.metadata_type();
        if !self.guids.is_empty() && !self.guids.iter().any(|g| g.eq_ignore_ascii_case(&header.guid)) {
            return false;
        }
        if !self.include_types.is_empty() && !self.include_types.contains(&mt) {
            return false;
        }
        if self.exclude_types.contains(&mt) {
            return false;
        }
        if !self.content_types.is_empty() && !self.content_types.contains(&header.content_type) {
            return false;
        }
        if self.exclude_content_types.contains(&header.content_type) {
            return false;
        }
        if !self.tags.is_empty()
            && !self
                .tags
                .iter()
                .any(|t| header.tags.iter().any(|h| h.eq_ignore_ascii_case(t)))
        {
            return false;
        }
        if let Some(author) = &self.author {
            if !header
                .author
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(author))
            {
                return false;
            }
        }
        if let Some(pattern) = &self.name_pattern {
            if !wildcard_match(pattern, &header.name) {
                return false;
            }
        }
        true
    }
}

/// Case-insensitive match where `%` stands for any run of characters.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let text = text.to_lowercase();
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut rest = text.as_str();
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            let Some(stripped) = rest.strip_prefix(part) else {
                return false;
            };
            rest = stripped;
        } else if i == last {
            return rest.ends_with(part);
        } else {
            let Some(pos) = rest.find(part) else {
                return false;
            };
            rest = &rest[pos + part.len()..];
        }
    }
    true
}

// ============================================================================
// Export / import payloads
// ============================================================================

/// One object of an `export_tml` response.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedObject {
    pub guid: String,
    pub content_type: Option<ContentType>,
    pub status: MigrationStatus,
    /// Raw diagnostic text, possibly with `<br/>` separators.
    pub message: String,
    /// The TML document; absent on `ERROR`.
    pub body: Option<Value>,
}

/// One entry of an import or connection create/update response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    pub status: MigrationStatus,
    /// Remote-assigned GUID; absent on errors and validate-only runs.
    pub guid: Option<String>,
    pub name: Option<String>,
    pub message: String,
}

impl ImportOutcome {
    pub fn ok(guid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            status: MigrationStatus::Ok,
            guid: Some(guid.into()),
            name: Some(name.into()),
            message: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: MigrationStatus::Error,
            guid: None,
            name: None,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportPolicy {
    /// Check the documents; change nothing.
    ValidateOnly,
    /// The batch succeeds only if every object does.
    AllOrNone,
    /// Each object succeeds or fails on its own.
    Partial,
}

impl ImportPolicy {
    pub fn as_api_str(self) -> &'static str {
        match self {
            ImportPolicy::ValidateOnly => "VALIDATE_ONLY",
            ImportPolicy::AllOrNone => "ALL_OR_NONE",
            ImportPolicy::Partial => "PARTIAL",
        }
    }

    pub fn mutates(self) -> bool {
        !matches!(self, ImportPolicy::ValidateOnly)
    }
}

impl fmt::Display for ImportPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_api_str())
    }
}

impl FromStr for ImportPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "validate" | "validate-only" => Ok(ImportPolicy::ValidateOnly),
            "all-or-none" => Ok(ImportPolicy::AllOrNone),
            "partial" => Ok(ImportPolicy::Partial),
            other => Err(format!(
                "unknown import policy `{other}` (expected validate, all-or-none or partial)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessLevel {
    ReadOnly,
    Modify,
}

impl AccessLevel {
    pub fn as_api_str(self) -> &'static str {
        match self {
            AccessLevel::ReadOnly => "READ_ONLY",
            AccessLevel::Modify => "MODIFY",
        }
    }
}

/// A principal to share imported content with.
///
/// Parses from `NAME` (read-only) or `NAME:read_only` / `NAME:modify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareTarget {
    pub principal: String,
    pub access: AccessLevel,
}

impl FromStr for ShareTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (principal, access) = match s.rsplit_once(':') {
            None => (s, AccessLevel::ReadOnly),
            Some((name, level)) => {
                let access = match level.trim().to_ascii_lowercase().replace('-', "_").as_str() {
                    "read_only" | "read" | "view" => AccessLevel::ReadOnly,
                    "modify" | "edit" => AccessLevel::Modify,
                    other => return Err(format!("unknown access level `{other}`")),
                };
                (name, access)
            }
        };
        let principal = principal.trim();
        if principal.is_empty() {
            return Err("share target has an empty principal name".to_string());
        }
        Ok(ShareTarget {
            principal: principal.to_string(),
            access,
        })
    }
}

// ============================================================================
// Collaborator trait
// ============================================================================

pub trait ContentApi {
    /// Every header matching `filter`, across all pages.
    fn list_content(&self, filter: &ContentFilter) -> Result<Vec<ContentHeader>, ApiError>;

    /// Export TML for `guids`. With `with_associated`, dependencies are
    /// appended to the response. `export_fqn` asks the platform to emit GUID
    /// references next to names.
    fn export_tml(
        &self,
        guids: &[String],
        with_associated: bool,
        export_fqn: bool,
    ) -> Result<Vec<ExportedObject>, ApiError>;

    /// Export one connection; `ApiError::NotFound` when it does not exist.
    fn export_connection(&self, guid: &str) -> Result<Value, ApiError>;

    /// Objects that `guid` is built on (the tables beneath a worksheet).
    fn parents_of(&self, guid: &str) -> Result<Vec<ContentHeader>, ApiError>;

    /// Submit one batch; the response has one entry per document, in order.
    fn import_tml(
        &self,
        documents: &[ContentDocument],
        policy: ImportPolicy,
        force_create: bool,
    ) -> Result<Vec<ImportOutcome>, ApiError>;

    fn create_connection(&self, document: &ContentDocument) -> Result<ImportOutcome, ApiError>;

    fn update_connection(
        &self,
        guid: &str,
        document: &ContentDocument,
    ) -> Result<ImportOutcome, ApiError>;

    fn assign_tags(
        &self,
        guids: &[String],
        metadata_type: MetadataType,
        tags: &[String],
    ) -> Result<(), ApiError>;

    fn share(
        &self,
        guids: &[String],
        metadata_type: MetadataType,
        targets: &[ShareTarget],
    ) -> Result<(), ApiError>;
}
