//! tmlsync migration engine
//!
//! Moves TML content between deployments whose GUIDs are deployment-local.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        EXPORT / IMPORT PIPELINE                          │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                                                                          │
//! │   source env                  content root                 dest env      │
//! │  ┌─────────┐   Exporter   ┌──────────────────┐  Importer  ┌─────────┐   │
//! │  │ REST v2 │─────────────►│ connection/ ...  │───────────►│ REST v2 │   │
//! │  └─────────┘              │ mappings/*.json  │            └────┬────┘   │
//! │                           │ logs/            │                 │        │
//! │                           └──────────────────┘                 │        │
//! │                                    ▲                           │        │
//! │                                    │ record / persist          │        │
//! │                           ┌────────┴─────────┐      poll       │        │
//! │                           │ GuidMappingStore │◄── Consistency ◄┘        │
//! │                           └──────────────────┘      Waiter              │
//! │                                                                          │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Import states
//!
//! `LOADED → DISAMBIGUATED → SUBMITTED → CLASSIFIED → MAPPED → CONSISTENT →
//! POST_PROCESSED`. A validate-only import stops at `CLASSIFIED`.
//!
//! Everything that touches the remote platform goes through the
//! [`ContentApi`] trait; everything that touches disk goes through
//! `tmlsync_storage`. All calls are blocking and single-threaded; a content
//! root must have a single writer.

pub mod api;
pub mod consistency;
pub mod context;
pub mod disambiguate;
pub mod error;
pub mod export;
pub mod import;
pub mod reconcile;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use api::{
    AccessLevel, ApiError, ContentApi, ContentFilter, ContentHeader, ExportedObject, ImportOutcome,
    ImportPolicy, ShareTarget,
};
pub use consistency::{ConsistencyWaiter, MAX_GUIDS_PER_CALL};
pub use context::{CancelToken, MigrationContext, WaitPolicy};
pub use disambiguate::Disambiguator;
pub use error::MigrationError;
pub use export::{ExportSelector, Exporter};
pub use import::{ImportOptions, ImportReport, ImportSource, ImportStage, Importer};
pub use reconcile::{ensure_credentials, reconcile, ConnectionPlan, ConnectionRoute};
