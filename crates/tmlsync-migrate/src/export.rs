//! Export content from the source environment into a content root.
//!
//! Objects are exported one at a time. Connections go through the connection
//! API because the TML API does not expose them. A failure on one object
//! becomes an `ERROR` result and the run continues; only listing failures,
//! storage I/O and cancellation end the run early.
//!
//! Export never touches the mapping store.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tmlsync_content::{
    is_guid, ContentDocument, ContentType, MigrationResult, MigrationStatus, DEFAULT_EXCLUDED_TYPES,
};
use tmlsync_storage::{ContentFilesystem, RunKind, RunLog};

use crate::api::{ApiError, ContentApi, ContentFilter, ContentHeader, ExportedObject};
use crate::context::MigrationContext;
use crate::error::MigrationError;

/// What to export: explicit GUIDs, or a filter. Never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportSelector {
    Guids(Vec<String>),
    Filter(ContentFilter),
}

impl ExportSelector {
    /// Validate a selector before any network call is made.
    pub fn new(filter: ContentFilter) -> Result<Self, MigrationError> {
        if !filter.guids.is_empty() {
            if filter.has_criteria() {
                return Err(MigrationError::InvalidSelector(
                    "explicit GUIDs cannot be combined with tag, author, type or name filters"
                        .to_string(),
                ));
            }
            if let Some(bad) = filter.guids.iter().find(|g| !is_guid(g)) {
                return Err(MigrationError::InvalidSelector(format!("`{bad}` is not a GUID")));
            }
            return Ok(ExportSelector::Guids(filter.guids));
        }
        if !filter.has_criteria() {
            return Err(MigrationError::InvalidSelector(
                "select content by GUID or by at least one of tags, author, type or name pattern"
                    .to_string(),
            ));
        }
        Ok(ExportSelector::Filter(filter))
    }

    /// The listing filter, with the never-migratable types excluded.
    pub fn listing_filter(&self) -> ContentFilter {
        let mut filter = match self {
            ExportSelector::Guids(guids) => ContentFilter {
                guids: guids.clone(),
                ..ContentFilter::default()
            },
            ExportSelector::Filter(filter) => filter.clone(),
        };
        filter.exclude(&DEFAULT_EXCLUDED_TYPES);
        filter
    }
}

pub struct Exporter<'a> {
    api: &'a dyn ContentApi,
    ctx: &'a MigrationContext,
}

impl<'a> Exporter<'a> {
    pub fn new(api: &'a dyn ContentApi, ctx: &'a MigrationContext) -> Self {
        Self { api, ctx }
    }

    /// Export every object matched by `selector` into `fs`, one result per
    /// attempted object. Associated objects are exported once even when
    /// several selected objects depend on them.
    pub fn export(
        &self,
        selector: &ExportSelector,
        with_associated: bool,
        fs: &ContentFilesystem,
    ) -> Result<Vec<MigrationResult>, MigrationError> {
        let headers = dedupe(self.api.list_content(&selector.listing_filter())?);
        if let ExportSelector::Guids(guids) = selector {
            for guid in guids {
                if !headers.iter().any(|h| h.guid.eq_ignore_ascii_case(guid)) {
                    tracing::warn!(guid = %guid, "no exportable object with this guid");
                }
            }
        }
        tracing::info!(
            org = self.ctx.org_label(),
            version = %self.ctx.platform_version,
            matched = headers.len(),
            "exporting content"
        );
        if headers.is_empty() {
            return Ok(Vec::new());
        }

        let run = fs.begin_run(RunKind::Export);
        let export_fqn = self.ctx.supports_export_fqn();
        if !export_fqn {
            run.note("platform predates export_fqn; resolving worksheet parents locally");
        }

        let (connections, content): (Vec<ContentHeader>, Vec<ContentHeader>) = headers
            .into_iter()
            .partition(|h| h.content_type.is_connection());

        let mut seen = BTreeSet::new();
        let mut results = Vec::new();

        for header in &connections {
            self.ctx.cancel.check()?;
            seen.insert(header.guid.to_ascii_lowercase());
            results.push(self.export_connection(header, fs, &run)?);
        }

        for header in &content {
            self.ctx.cancel.check()?;
            let key = header.guid.to_ascii_lowercase();
            if seen.contains(&key) {
                continue;
            }
            let objects = match self
                .api
                .export_tml(std::slice::from_ref(&header.guid), with_associated, export_fqn)
            {
                Ok(objects) => objects,
                Err(err) => {
                    tracing::warn!(guid = %header.guid, error = %err, "export failed");
                    seen.insert(key);
                    results.push(MigrationResult::error(
                        &header.guid,
                        header.content_type,
                        &header.name,
                        err.to_string(),
                    ));
                    continue;
                }
            };

            for object in objects {
                if !seen.insert(object.guid.to_ascii_lowercase()) {
                    continue;
                }
                results.push(self.store_object(object, header, export_fqn, fs, &run)?);
            }
            if seen.insert(key) {
                results.push(MigrationResult::error(
                    &header.guid,
                    header.content_type,
                    &header.name,
                    "object missing from the export response",
                ));
            }
        }

        run.append_results(&results);
        Ok(results)
    }

    fn export_connection(
        &self,
        header: &ContentHeader,
        fs: &ContentFilesystem,
        run: &RunLog,
    ) -> Result<MigrationResult, MigrationError> {
        let failed = |message: String| -> Result<MigrationResult, MigrationError> {
            tracing::warn!(guid = %header.guid, error = %message, "connection export failed");
            Ok(MigrationResult::error(
                &header.guid,
                ContentType::Connection,
                &header.name,
                message,
            ))
        };

        let body = match self.api.export_connection(&header.guid) {
            Ok(body) => body,
            Err(err) => return failed(err.to_string()),
        };
        let mut document = match ContentDocument::from_value_as(ContentType::Connection, body) {
            Ok(document) => document,
            Err(err) => return failed(format!("unreadable connection TML: {err}")),
        };
        if document.guid().is_none() {
            if let Err(err) = document.set_guid(&header.guid) {
                return failed(err.to_string());
            }
        }

        fs.write(&document)?;
        run.append_log(&document, None);
        tracing::debug!(guid = %header.guid, name = %header.name, "exported connection");
        Ok(MigrationResult::new(
            &header.guid,
            ContentType::Connection,
            document.display_name(),
            MigrationStatus::Ok,
        ))
    }

    fn store_object(
        &self,
        object: ExportedObject,
        requested: &ContentHeader,
        export_fqn: bool,
        fs: &ContentFilesystem,
        run: &RunLog,
    ) -> Result<MigrationResult, MigrationError> {
        let content_type = object.content_type.unwrap_or(requested.content_type);
        let name = if object.guid.eq_ignore_ascii_case(&requested.guid) {
            requested.name.as_str()
        } else {
            ""
        };
        let failed = |message: &str| -> Result<MigrationResult, MigrationError> {
            tracing::warn!(guid = %object.guid, content_type = %content_type, error = message, "export failed");
            Ok(MigrationResult::error(&object.guid, content_type, name, message))
        };

        if object.status.is_error() {
            return failed(&object.message);
        }
        let Some(body) = object.body.clone() else {
            return failed("export response carried no document");
        };
        let mut document = match ContentDocument::from_value(body) {
            Ok(document) => document,
            Err(err) => return failed(&format!("unreadable TML: {err}")),
        };
        if document.guid().is_none() {
            if let Err(err) = document.set_guid(&object.guid) {
                return failed(&err.to_string());
            }
        }

        let mut result = MigrationResult::new(
            document.guid().unwrap_or(&object.guid),
            document.content_type(),
            document.display_name(),
            object.status,
        )
        .with_messages(&object.message);

        if !export_fqn && document.content_type() == ContentType::Worksheet {
            let notes = match self.resolve_parent_names(&mut document) {
                Ok(notes) => notes,
                Err(err) => vec![format!("could not resolve parent tables: {err}")],
            };
            if !notes.is_empty() {
                if result.status == MigrationStatus::Ok {
                    result.status = MigrationStatus::Warning;
                }
                result.messages.extend(notes);
            }
        }

        fs.write(&document)?;
        run.append_log(&document, None);
        tracing::debug!(guid = %result.guid, content_type = %result.content_type, "exported");
        Ok(result)
    }

    /// Fill missing table references of a worksheet from its parents, by
    /// name. Returns a note for every name shared by several parents.
    fn resolve_parent_names(&self, document: &mut ContentDocument) -> Result<Vec<String>, ApiError> {
        let Some(guid) = document.guid().map(str::to_string) else {
            return Ok(Vec::new());
        };
        let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for parent in self.api.parents_of(&guid)? {
            by_name
                .entry(parent.name.to_lowercase())
                .or_default()
                .push(parent.guid);
        }

        let mut notes = Vec::new();
        document.visit_reference_slots_mut(|path, slot, leaf| {
            if slot
                .get(leaf)
                .and_then(Value::as_str)
                .is_some_and(|v| !v.is_empty())
            {
                return;
            }
            let Some(name) = slot.get("name").and_then(Value::as_str).map(str::to_string) else {
                return;
            };
            match by_name.get(&name.to_lowercase()).map(Vec::as_slice) {
                Some([only]) => {
                    slot.insert(leaf.to_string(), Value::String(only.clone()));
                }
                Some(many) if many.len() > 1 => {
                    tracing::warn!(worksheet = %guid, table = %name, parents = many.len(), "ambiguous parent name");
                    notes.push(format!(
                        "{path}: {} parent objects are named `{name}`; reference left unresolved",
                        many.len()
                    ));
                }
                _ => {}
            }
        });
        Ok(notes)
    }
}

fn dedupe(headers: Vec<ContentHeader>) -> Vec<ContentHeader> {
    let mut seen = BTreeSet::new();
    headers
        .into_iter()
        .filter(|h| seen.insert(h.guid.to_ascii_lowercase()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ApiCall, FakeApi};
    use serde_json::json;
    use tempfile::tempdir;
    use tmlsync_content::{MetadataType, PlatformVersion};

    const WS1: &str = "2d5b3f8e-0001-4c4c-9d0e-1f4b1a2c3d4e";
    const WS2: &str = "2d5b3f8e-0002-4c4c-9d0e-1f4b1a2c3d4e";
    const WS3: &str = "2d5b3f8e-0003-4c4c-9d0e-1f4b1a2c3d4e";
    const ORDERS: &str = "0a7c5a4e-0001-4a6f-8b1e-6f0a3c9e2b10";
    const CUST_A: &str = "0a7c5a4e-0002-4a6f-8b1e-6f0a3c9e2b10";
    const CUST_B: &str = "0a7c5a4e-0003-4a6f-8b1e-6f0a3c9e2b10";
    const CONN: &str = "7f1e4b1c-6a2d-4f5e-9a8b-0c1d2e3f4a5b";

    fn ctx(version: &str) -> MigrationContext {
        MigrationContext::new(version.parse::<PlatformVersion>().unwrap())
    }

    fn worksheet(guid: &str, name: &str, tables: &[(&str, &str)]) -> ContentDocument {
        let tables: Vec<_> = tables
            .iter()
            .map(|(n, fqn)| json!({ "name": n, "fqn": fqn }))
            .collect();
        ContentDocument::from_parts(
            ContentType::Worksheet,
            Some(guid),
            json!({ "name": name, "tables": tables }),
        )
        .unwrap()
    }

    fn table(guid: &str, name: &str) -> ContentDocument {
        ContentDocument::from_parts(ContentType::Table, Some(guid), json!({ "name": name })).unwrap()
    }

    fn tagged(tag: &str) -> ExportSelector {
        ExportSelector::new(ContentFilter {
            tags: vec![tag.to_string()],
            ..ContentFilter::default()
        })
        .unwrap()
    }

    fn files(dir: &std::path::Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn selector_rejects_mixed_or_empty_criteria() {
        let mixed = ContentFilter {
            guids: vec![WS1.into()],
            tags: vec!["prod-ready".into()],
            ..ContentFilter::default()
        };
        assert!(matches!(ExportSelector::new(mixed), Err(MigrationError::InvalidSelector(_))));
        assert!(matches!(
            ExportSelector::new(ContentFilter::default()),
            Err(MigrationError::InvalidSelector(_))
        ));
        let bad = ContentFilter {
            guids: vec!["orders".into()],
            ..ContentFilter::default()
        };
        assert!(matches!(ExportSelector::new(bad), Err(MigrationError::InvalidSelector(_))));
    }

    #[test]
    fn listing_filter_always_excludes_non_migratable_types() {
        let selector = ExportSelector::new(ContentFilter {
            guids: vec![WS1.into()],
            ..ContentFilter::default()
        })
        .unwrap();
        let filter = selector.listing_filter();
        for t in DEFAULT_EXCLUDED_TYPES {
            assert!(filter.exclude_types.contains(&t));
        }
    }

    #[test]
    fn content_type_filter_tells_worksheets_from_tables() {
        let api = FakeApi::new();
        api.insert(table(ORDERS, "orders"), None, &["prod-ready"]);
        api.insert(worksheet(WS1, "Sales", &[]), None, &["prod-ready"]);
        let dir = tempdir().unwrap();
        let fs = ContentFilesystem::initialize(dir.path()).unwrap();
        let ctx = ctx("9.5.0");

        let only_worksheets = ExportSelector::new(ContentFilter {
            tags: vec!["prod-ready".into()],
            content_types: vec![ContentType::Worksheet],
            ..ContentFilter::default()
        })
        .unwrap();
        let results = Exporter::new(&api, &ctx)
            .export(&only_worksheets, false, &fs)
            .unwrap();

        let types: Vec<ContentType> = results.iter().map(|r| r.content_type).collect();
        assert_eq!(types, vec![ContentType::Worksheet]);
        assert!(files(&fs.type_dir(ContentType::Table)).is_empty());

        let no_tables = ExportSelector::new(ContentFilter {
            tags: vec!["prod-ready".into()],
            exclude_content_types: vec![ContentType::Table],
            ..ContentFilter::default()
        })
        .unwrap();
        let results = Exporter::new(&api, &ctx).export(&no_tables, false, &fs).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].guid, WS1);
    }

    #[test]
    fn tagged_worksheets_are_written_and_mapping_is_untouched() {
        let api = FakeApi::new();
        api.insert(worksheet(WS1, "Sales", &[]), None, &["prod-ready"]);
        api.insert(worksheet(WS2, "Returns", &[]), None, &["prod-ready"]);
        api.insert(worksheet(WS3, "Scratch", &[]), None, &[]);
        let dir = tempdir().unwrap();
        let fs = ContentFilesystem::initialize(dir.path()).unwrap();
        let ctx = ctx("9.5.0");

        let results = Exporter::new(&api, &ctx)
            .export(&tagged("prod-ready"), false, &fs)
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == MigrationStatus::Ok));
        assert_eq!(
            files(&fs.type_dir(ContentType::Worksheet)),
            vec![format!("{WS1}.worksheet.doc"), format!("{WS2}.worksheet.doc")]
        );
        assert!(files(&fs.mappings_dir()).is_empty());
        assert!(api.calls().iter().all(|c| !c.is_mutation()));
    }

    #[test]
    fn one_failing_object_does_not_abort_the_batch() {
        let api = FakeApi::new();
        api.insert(worksheet(WS1, "Sales", &[]), None, &["prod-ready"]);
        api.insert(worksheet(WS2, "Returns", &[]), None, &["prod-ready"]);
        api.fail_export(WS1);
        let dir = tempdir().unwrap();
        let fs = ContentFilesystem::initialize(dir.path()).unwrap();
        let ctx = ctx("9.5.0");

        let results = Exporter::new(&api, &ctx)
            .export(&tagged("prod-ready"), false, &fs)
            .unwrap();

        let failed: Vec<_> = results.iter().filter(|r| r.is_error()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].guid, WS1);
        assert_eq!(failed[0].messages, vec!["Export failed", "User does not have access"]);
        assert_eq!(
            files(&fs.type_dir(ContentType::Worksheet)),
            vec![format!("{WS2}.worksheet.doc")]
        );
    }

    #[test]
    fn associated_objects_are_exported_once() {
        let api = FakeApi::new();
        api.insert(table(ORDERS, "orders"), None, &[]);
        api.insert(worksheet(WS1, "Sales", &[("orders", ORDERS)]), None, &["prod-ready"]);
        api.insert(worksheet(WS2, "Returns", &[("orders", ORDERS)]), None, &["prod-ready"]);
        let dir = tempdir().unwrap();
        let fs = ContentFilesystem::initialize(dir.path()).unwrap();
        let ctx = ctx("9.5.0");

        let results = Exporter::new(&api, &ctx)
            .export(&tagged("prod-ready"), true, &fs)
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(
            results.iter().filter(|r| r.content_type == ContentType::Table).count(),
            1
        );
        assert_eq!(
            files(&fs.type_dir(ContentType::Table)),
            vec![format!("{ORDERS}.table.doc")]
        );
    }

    #[test]
    fn connections_use_the_connection_export() {
        let api = FakeApi::new();
        let conn = ContentDocument::from_parts(
            ContentType::Connection,
            Some(CONN),
            json!({ "name": "warehouse", "type": "RDBMS_SNOWFLAKE" }),
        )
        .unwrap();
        api.insert(conn, None, &[]);
        let dir = tempdir().unwrap();
        let fs = ContentFilesystem::initialize(dir.path()).unwrap();
        let ctx = ctx("9.5.0");

        let selector = ExportSelector::new(ContentFilter {
            include_types: vec![MetadataType::Connection],
            ..ContentFilter::default()
        })
        .unwrap();
        let results = Exporter::new(&api, &ctx).export(&selector, false, &fs).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, MigrationStatus::Ok);
        assert!(fs.document_path(ContentType::Connection, CONN).is_file());
        let calls = api.calls();
        assert!(calls.contains(&ApiCall::ExportConnection { guid: CONN.into() }));
        assert!(!calls.iter().any(|c| matches!(c, ApiCall::ExportTml { .. })));
    }

    #[test]
    fn old_platforms_resolve_worksheet_parents_by_name() {
        let api = FakeApi::new();
        api.insert(
            worksheet(WS1, "Sales", &[("orders", ORDERS), ("customers", CUST_A)]),
            None,
            &["prod-ready"],
        );
        let parent = |guid: &str, name: &str| ContentHeader {
            guid: guid.into(),
            name: name.into(),
            content_type: ContentType::Table,
            author: None,
            tags: Vec::new(),
        };
        api.set_parents(
            WS1,
            vec![
                parent(ORDERS, "Orders"),
                parent(CUST_A, "customers"),
                parent(CUST_B, "customers"),
            ],
        );
        let dir = tempdir().unwrap();
        let fs = ContentFilesystem::initialize(dir.path()).unwrap();
        let ctx = ctx("8.10.0");

        let results = Exporter::new(&api, &ctx)
            .export(&tagged("prod-ready"), false, &fs)
            .unwrap();

        assert!(api.calls().contains(&ApiCall::ExportTml {
            guids: vec![WS1.into()],
            with_associated: false,
            export_fqn: false,
        }));
        assert_eq!(results[0].status, MigrationStatus::Warning);
        assert!(results[0].messages[0].contains("customers"));

        let stored = fs.load_one(WS1).unwrap();
        let refs: Vec<String> = stored.references().into_iter().map(|r| r.value).collect();
        assert_eq!(refs, vec![ORDERS.to_string()]);
    }

    #[test]
    fn nothing_matched_yields_no_results_and_no_run() {
        let api = FakeApi::new();
        let dir = tempdir().unwrap();
        let fs = ContentFilesystem::initialize(dir.path()).unwrap();
        let ctx = ctx("9.5.0");
        let results = Exporter::new(&api, &ctx)
            .export(&tagged("prod-ready"), false, &fs)
            .unwrap();
        assert!(results.is_empty());
        assert!(files(&fs.logs_dir()).is_empty());
    }
}
