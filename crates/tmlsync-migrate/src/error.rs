//! Engine-level errors.
//!
//! Only run-fatal conditions become a `MigrationError`. Per-object failures
//! (remote `ERROR` statuses, single-object transport failures) are reported
//! as `MigrationResult`s instead.

use std::time::Duration;

use thiserror::Error;
use tmlsync_content::DocumentError;
use tmlsync_storage::StorageError;

use crate::api::ApiError;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("invalid export selector: {0}")]
    InvalidSelector(String),

    #[error("invalid import source: {0}")]
    InvalidSource(String),

    #[error("connection `{name}` ({guid}) carries no password property")]
    MissingCredential { guid: String, name: String },

    #[error("{pending} of {total} imported objects still not visible after {}s", .waited.as_secs())]
    ConsistencyTimeout {
        pending: usize,
        total: usize,
        waited: Duration,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("import response has {received} entries for {sent} submitted documents")]
    ResponseMismatch { sent: usize, received: usize },

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl MigrationError {
    /// True when re-running the same operation may succeed without operator
    /// changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            MigrationError::ConsistencyTimeout { .. } => true,
            MigrationError::Api(err) => err.is_transient(),
            _ => false,
        }
    }
}
