//! Connection-document helpers.
//!
//! A connection TML carries its credentials under `connection.properties`
//! (`[{ key, value }]`) and the tables it exposes under `connection.table`,
//! each addressed by `external_table.{db_name, schema_name, table_name}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::ContentDocument;

/// Exact `(database, schema, table)` address of a connection table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableKey {
    pub database: String,
    pub schema: String,
    pub table: String,
}

impl TableKey {
    fn from_entry(entry: &Value) -> TableKey {
        let ext = entry.get("external_table");
        let field = |name: &str| {
            ext.and_then(|e| e.get(name))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        TableKey {
            database: field("db_name"),
            schema: field("schema_name"),
            table: field("table_name"),
        }
    }
}

impl std::fmt::Display for TableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.database, self.schema, self.table)
    }
}

impl ContentDocument {
    /// Tables declared by a connection document (empty for other types).
    pub fn connection_tables(&self) -> Vec<TableKey> {
        if !self.content_type().is_connection() {
            return Vec::new();
        }
        self.content()
            .and_then(|c| c.get("table"))
            .and_then(Value::as_array)
            .map(|tables| tables.iter().map(TableKey::from_entry).collect())
            .unwrap_or_default()
    }

    /// Keep only the connection tables for which `keep` returns true.
    /// Returns the keys that were removed.
    pub fn retain_connection_tables(&mut self, mut keep: impl FnMut(&TableKey) -> bool) -> Vec<TableKey> {
        let mut removed = Vec::new();
        if !self.content_type().is_connection() {
            return removed;
        }
        let Some(tables) = self
            .content_mut()
            .and_then(|c| c.get_mut("table"))
            .and_then(Value::as_array_mut)
        else {
            return removed;
        };
        tables.retain(|entry| {
            let key = TableKey::from_entry(entry);
            if keep(&key) {
                true
            } else {
                removed.push(key);
                false
            }
        });
        removed
    }

    /// True when at least one password-like property carries a non-empty value.
    pub fn has_connection_password(&self) -> bool {
        self.content()
            .and_then(|c| c.get("properties"))
            .and_then(Value::as_array)
            .is_some_and(|props| {
                props.iter().any(|p| {
                    let key = p.get("key").and_then(Value::as_str).unwrap_or_default();
                    let value = p.get("value").and_then(Value::as_str).unwrap_or_default();
                    key.to_ascii_lowercase().contains("password") && !value.trim().is_empty()
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_type::ContentType;
    use serde_json::json;

    fn conn(password: &str) -> ContentDocument {
        ContentDocument::from_parts(
            ContentType::Connection,
            Some("7f1e4b1c-6a2d-4f5e-9a8b-0c1d2e3f4a5b"),
            json!({
                "name": "warehouse",
                "type": "RDBMS_SNOWFLAKE",
                "properties": [
                    { "key": "accountName", "value": "acme" },
                    { "key": "password", "value": password }
                ],
                "table": [
                    { "name": "orders", "external_table": { "db_name": "DB", "schema_name": "PUBLIC", "table_name": "ORDERS" } },
                    { "name": "returns", "external_table": { "db_name": "DB", "schema_name": "PUBLIC", "table_name": "RETURNS" } }
                ]
            }),
        )
        .unwrap()
    }

    #[test]
    fn password_must_be_non_empty() {
        assert!(conn("s3cret").has_connection_password());
        assert!(!conn("  ").has_connection_password());
    }

    #[test]
    fn retain_reports_removed_tables() {
        let mut doc = conn("x");
        let removed = doc.retain_connection_tables(|k| k.table == "ORDERS");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].to_string(), "DB.PUBLIC.RETURNS");
        assert_eq!(doc.connection_tables().len(), 1);
    }
}
