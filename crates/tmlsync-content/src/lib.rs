//! TML content model
//!
//! This crate defines the typed representation of migratable content:
//!
//! - `ContentType` / `MetadataType`: closed enums for the kinds of objects we
//!   store on disk and the kinds the remote platform lists,
//! - `ContentDocument`: one exported object (JSON TML) plus a static scan of
//!   its embedded GUID references,
//! - `MigrationResult`: the per-object outcome of an export or import,
//! - `PlatformVersion`: dotted release versions used for feature gates.
//!
//! Reference discovery is a static traversal: every content type declares the
//! field paths that may carry a GUID (`ContentType::reference_paths`), so
//! adding a type is a compile-time checked change.

pub mod connection;
pub mod content_type;
pub mod document;
pub mod result;
pub mod version;

pub use connection::TableKey;
pub use content_type::{ContentType, MetadataType, PathSegment, DEFAULT_EXCLUDED_TYPES};
pub use document::{is_guid, ContentDocument, DocumentError, EmbeddedReference, Rewrite};
pub use result::{split_messages, MigrationResult, MigrationStatus};
pub use version::PlatformVersion;
