//! Connection reconciliation.
//!
//! Updating a connection must never create tables on the destination; table
//! creation only happens through the table import path. Before an update the
//! incoming connection is therefore trimmed to the tables the existing remote
//! connection already has. A connection with no remote counterpart is created
//! as-is.

use std::collections::BTreeSet;

use tmlsync_content::{ContentDocument, TableKey};

use crate::error::MigrationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionRoute {
    Create,
    Update { guid: String },
}

#[derive(Debug, Clone)]
pub struct ConnectionPlan {
    pub document: ContentDocument,
    pub route: ConnectionRoute,
    /// Tables dropped from the incoming document.
    pub dropped_tables: Vec<TableKey>,
}

/// Plan the create-or-update of `incoming` given the destination's current
/// version of the same connection.
pub fn reconcile(incoming: &ContentDocument, existing: Option<&ContentDocument>) -> ConnectionPlan {
    let Some(existing) = existing else {
        return ConnectionPlan {
            document: incoming.clone(),
            route: ConnectionRoute::Create,
            dropped_tables: Vec::new(),
        };
    };

    let known: BTreeSet<TableKey> = existing.connection_tables().into_iter().collect();
    let mut document = incoming.clone();
    let dropped_tables = document.retain_connection_tables(|key| known.contains(key));

    let guid = existing
        .guid()
        .or(incoming.guid())
        .unwrap_or_default()
        .to_string();
    if let Err(err) = document.set_guid(&guid) {
        tracing::debug!(guid = %guid, error = %err, "existing connection has no usable guid");
    }

    for table in &dropped_tables {
        tracing::warn!(
            connection = incoming.display_name(),
            table = %table,
            "dropping table absent from the existing connection"
        );
    }

    ConnectionPlan {
        document,
        route: ConnectionRoute::Update { guid },
        dropped_tables,
    }
}

/// Every connection must carry a non-empty password property. Checked for the
/// whole batch before anything is sent.
pub fn ensure_credentials(connections: &[ContentDocument]) -> Result<(), MigrationError> {
    match connections.iter().find(|c| !c.has_connection_password()) {
        Some(missing) => Err(MigrationError::MissingCredential {
            guid: missing.guid().unwrap_or("-").to_string(),
            name: missing.display_name().to_string(),
        }),
        None => Ok(()),
    }
}
