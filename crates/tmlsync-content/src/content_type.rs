//! Closed content-type enums.
//!
//! `ContentType` is what we store under the content filesystem (one directory
//! per variant). `MetadataType` is what the remote platform lists and filters
//! on; several content types share the `LOGICAL_TABLE` metadata type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::document::DocumentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Connection,
    Table,
    View,
    SqlView,
    Worksheet,
    Answer,
    Liveboard,
}

/// One step of a declared reference path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSegment {
    /// Descend into an object field.
    Field(&'static str),
    /// Visit every element of an array.
    Each,
}

use PathSegment::{Each, Field};

const TABLE_REFS: &[&[PathSegment]] = &[&[Field("table"), Field("connection"), Field("fqn")]];
const SQL_VIEW_REFS: &[&[PathSegment]] =
    &[&[Field("sql_view"), Field("connection"), Field("fqn")]];
const VIEW_REFS: &[&[PathSegment]] = &[&[Field("view"), Field("tables"), Each, Field("fqn")]];
const WORKSHEET_REFS: &[&[PathSegment]] =
    &[&[Field("worksheet"), Field("tables"), Each, Field("fqn")]];
const ANSWER_REFS: &[&[PathSegment]] = &[&[Field("answer"), Field("tables"), Each, Field("fqn")]];
const LIVEBOARD_REFS: &[&[PathSegment]] = &[&[
    Field("liveboard"),
    Field("visualizations"),
    Each,
    Field("answer"),
    Field("tables"),
    Each,
    Field("fqn"),
]];

impl ContentType {
    /// Every content type, in dependency order (connections first).
    pub const ALL: [ContentType; 7] = [
        ContentType::Connection,
        ContentType::Table,
        ContentType::View,
        ContentType::SqlView,
        ContentType::Worksheet,
        ContentType::Answer,
        ContentType::Liveboard,
    ];

    /// Directory name, filename component and top-level TML key.
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Connection => "connection",
            ContentType::Table => "table",
            ContentType::View => "view",
            ContentType::SqlView => "sql_view",
            ContentType::Worksheet => "worksheet",
            ContentType::Answer => "answer",
            ContentType::Liveboard => "liveboard",
        }
    }

    pub fn metadata_type(self) -> MetadataType {
        match self {
            ContentType::Connection => MetadataType::Connection,
            ContentType::Table
            | ContentType::View
            | ContentType::SqlView
            | ContentType::Worksheet => MetadataType::LogicalTable,
            ContentType::Answer => MetadataType::Answer,
            ContentType::Liveboard => MetadataType::Liveboard,
        }
    }

    pub fn is_connection(self) -> bool {
        matches!(self, ContentType::Connection)
    }

    /// Field paths (relative to the document root) that may carry a GUID
    /// reference to another object.
    pub fn reference_paths(self) -> &'static [&'static [PathSegment]] {
        match self {
            ContentType::Connection => &[],
            ContentType::Table => TABLE_REFS,
            ContentType::SqlView => SQL_VIEW_REFS,
            ContentType::View => VIEW_REFS,
            ContentType::Worksheet => WORKSHEET_REFS,
            ContentType::Answer => ANSWER_REFS,
            ContentType::Liveboard => LIVEBOARD_REFS,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase().replace('-', "_");
        ContentType::ALL
            .into_iter()
            .find(|t| t.as_str() == norm)
            .ok_or_else(|| DocumentError::UnknownContentType(s.to_string()))
    }
}

/// Object kinds as the remote metadata listing knows them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetadataType {
    Connection,
    LogicalTable,
    Answer,
    Liveboard,
    LogicalColumn,
    LogicalRelationship,
    User,
    UserGroup,
}

/// Types that are never independently migratable; always appended to an
/// export's exclusion filter.
pub const DEFAULT_EXCLUDED_TYPES: [MetadataType; 4] = [
    MetadataType::LogicalColumn,
    MetadataType::LogicalRelationship,
    MetadataType::User,
    MetadataType::UserGroup,
];

impl MetadataType {
    pub fn as_api_str(self) -> &'static str {
        match self {
            MetadataType::Connection => "CONNECTION",
            MetadataType::LogicalTable => "LOGICAL_TABLE",
            MetadataType::Answer => "ANSWER",
            MetadataType::Liveboard => "LIVEBOARD",
            MetadataType::LogicalColumn => "LOGICAL_COLUMN",
            MetadataType::LogicalRelationship => "LOGICAL_RELATIONSHIP",
            MetadataType::User => "USER",
            MetadataType::UserGroup => "USER_GROUP",
        }
    }
}

impl fmt::Display for MetadataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_api_str())
    }
}
