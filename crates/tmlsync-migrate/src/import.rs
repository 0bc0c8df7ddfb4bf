//! Import content from a content root into the destination environment.
//!
//! ```text
//! LOADED ──► DISAMBIGUATED ──► SUBMITTED ──► CLASSIFIED ──┬──► (validate-only: stop)
//!                                                         │
//!                                                         └──► MAPPED ──► CONSISTENT ──► POST_PROCESSED
//! ```
//!
//! Connections form their own sub-batch and always go first, one connection
//! at a time, because tables elsewhere in the import may live on them. All
//! other documents are disambiguated and submitted in one batched call whose
//! response is matched back to the request; a response of the wrong length
//! fails the run rather than being guessed at.
//!
//! Which results reach the mapping store depends on the policy:
//!
//! | policy          | mapping updates                            |
//! |-----------------|--------------------------------------------|
//! | `VALIDATE_ONLY` | none                                       |
//! | `ALL_OR_NONE`   | all objects, or none if any object failed  |
//! | `PARTIAL`       | every object that did not fail             |

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tmlsync_content::{
    is_guid, ContentDocument, ContentType, MetadataType, MigrationResult, MigrationStatus,
};
use tmlsync_storage::{ContentFilesystem, GuidMappingStore, RunKind, RunLog, StorageError};

use crate::api::{ApiError, ContentApi, ImportOutcome, ImportPolicy, ShareTarget};
use crate::consistency::ConsistencyWaiter;
use crate::context::{MigrationContext, WaitPolicy};
use crate::disambiguate::Disambiguator;
use crate::error::MigrationError;
use crate::reconcile::{ensure_credentials, reconcile, ConnectionRoute};

/// Where documents come from: one GUID, or a scan of the type directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportSource {
    Single(String),
    Scan {
        include: Vec<ContentType>,
        exclude: Vec<ContentType>,
    },
}

impl ImportSource {
    pub fn new(
        guid: Option<String>,
        include: Vec<ContentType>,
        exclude: Vec<ContentType>,
    ) -> Result<Self, MigrationError> {
        match guid {
            Some(_) if !include.is_empty() || !exclude.is_empty() => Err(
                MigrationError::InvalidSource(
                    "a single GUID cannot be combined with type filters".to_string(),
                ),
            ),
            Some(guid) if !is_guid(&guid) => Err(MigrationError::InvalidSource(format!(
                "`{guid}` is not a GUID"
            ))),
            Some(guid) => Ok(ImportSource::Single(guid)),
            None => Ok(ImportSource::Scan { include, exclude }),
        }
    }

    pub fn all() -> Self {
        ImportSource::Scan {
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    /// Types to scan, in dependency order.
    pub fn types(&self) -> Vec<ContentType> {
        match self {
            ImportSource::Single(_) => ContentType::ALL.to_vec(),
            ImportSource::Scan { include, exclude } => ContentType::ALL
                .into_iter()
                .filter(|t| include.is_empty() || include.contains(t))
                .filter(|t| !exclude.contains(t))
                .collect(),
        }
    }

    fn load(&self, fs: &ContentFilesystem) -> Result<Vec<ContentDocument>, StorageError> {
        match self {
            ImportSource::Single(guid) => Ok(vec![fs.load_one(guid)?]),
            ImportSource::Scan { .. } => fs.load_all(&self.types()).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub policy: ImportPolicy,
    /// Ask the platform for new objects instead of updating mapped ones.
    pub force_create: bool,
    pub source_env: String,
    pub dest_env: String,
    pub tags: Vec<String>,
    pub share_with: Vec<ShareTarget>,
    /// `None` skips the consistency wait.
    pub wait: Option<WaitPolicy>,
}

impl ImportOptions {
    pub fn new(policy: ImportPolicy, source_env: &str, dest_env: &str) -> Self {
        Self {
            policy,
            force_create: false,
            source_env: source_env.to_string(),
            dest_env: dest_env.to_string(),
            tags: Vec::new(),
            share_with: Vec::new(),
            wait: Some(WaitPolicy::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ImportStage {
    Loaded,
    Disambiguated,
    Submitted,
    Classified,
    Mapped,
    Consistent,
    PostProcessed,
}

impl ImportStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportStage::Loaded => "LOADED",
            ImportStage::Disambiguated => "DISAMBIGUATED",
            ImportStage::Submitted => "SUBMITTED",
            ImportStage::Classified => "CLASSIFIED",
            ImportStage::Mapped => "MAPPED",
            ImportStage::Consistent => "CONSISTENT",
            ImportStage::PostProcessed => "POST_PROCESSED",
        }
    }
}

impl fmt::Display for ImportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ImportReport {
    pub results: Vec<MigrationResult>,
    /// Last state reached.
    pub stage: ImportStage,
}

impl ImportReport {
    pub fn count(&self, status: MigrationStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// An accepted object, eligible for a mapping update and post-processing.
#[derive(Debug, Clone)]
struct Committed {
    source_guid: String,
    dest_guid: String,
    content_type: ContentType,
}

pub struct Importer<'a> {
    api: &'a dyn ContentApi,
    ctx: &'a MigrationContext,
}

impl<'a> Importer<'a> {
    pub fn new(api: &'a dyn ContentApi, ctx: &'a MigrationContext) -> Self {
        Self { api, ctx }
    }

    pub fn import(
        &self,
        fs: &ContentFilesystem,
        source: &ImportSource,
        options: &ImportOptions,
    ) -> Result<ImportReport, MigrationError> {
        let documents = source.load(fs)?;
        let mut stage = ImportStage::Loaded;
        tracing::info!(
            org = self.ctx.org_label(),
            policy = %options.policy,
            source_env = %options.source_env,
            dest_env = %options.dest_env,
            documents = documents.len(),
            "importing content"
        );
        if documents.is_empty() {
            tracing::warn!(root = %fs.root().display(), "nothing to import");
            return Ok(ImportReport {
                results: Vec::new(),
                stage,
            });
        }

        let (connections, content): (Vec<ContentDocument>, Vec<ContentDocument>) = documents
            .into_iter()
            .partition(|d| d.content_type().is_connection());

        // Preconditions, before anything is sent.
        if options.policy.mutates() {
            ensure_credentials(&connections)?;
        }
        let mut mapping = if options.policy.mutates() {
            fs.get_or_create_mapping(&options.source_env, &options.dest_env)?
        } else {
            GuidMappingStore::load(
                &fs.mapping_path(&options.source_env, &options.dest_env),
                &options.source_env,
                &options.dest_env,
            )?
        };

        let run = fs.begin_run(RunKind::Import);
        run.note(&format!(
            "policy={} force_create={} {} -> {}",
            options.policy, options.force_create, options.source_env, options.dest_env
        ));

        let mut results = Vec::new();
        let mut committed = Vec::new();

        if !connections.is_empty() {
            let outcome = self.import_connections(
                &connections,
                options,
                &mapping,
                &run,
                &mut results,
                &mut committed,
            );
            // Connections already exist on the destination, so their rows
            // must be on disk before the content batch can fail the run.
            if options.policy.mutates() && !committed.is_empty() {
                record_committed(&mut mapping, &committed, options);
                mapping.persist()?;
                tracing::info!(recorded = committed.len(), "connection mappings persisted");
            }
            outcome?;
        }
        let connection_count = committed.len();

        if !content.is_empty() {
            let prepared: Vec<ContentDocument> = {
                let disambiguator = Disambiguator::new(&mapping, &options.dest_env)
                    .delete_unresolved(options.force_create);
                content.iter().map(|d| disambiguator.rewrite(d)).collect()
            };
            stage = ImportStage::Disambiguated;
            tracing::debug!(stage = %stage, documents = prepared.len(), "references rewritten");
            for (original, document) in content.iter().zip(&prepared) {
                run.append_log(document, original.guid());
            }

            self.ctx.cancel.check()?;
            let outcomes = self
                .api
                .import_tml(&prepared, options.policy, options.force_create)
                .unwrap_or_else(|err| {
                    tracing::warn!(error = %err, documents = prepared.len(), "import call failed");
                    prepared
                        .iter()
                        .map(|_| ImportOutcome::error(err.to_string()))
                        .collect()
                });
            stage = ImportStage::Submitted;
            tracing::debug!(stage = %stage, outcomes = outcomes.len(), "batch submitted");
            if outcomes.len() != prepared.len() {
                run.note(&format!(
                    "import response has {} entries for {} documents; nothing recorded",
                    outcomes.len(),
                    prepared.len()
                ));
                return Err(MigrationError::ResponseMismatch {
                    sent: prepared.len(),
                    received: outcomes.len(),
                });
            }

            self.classify_batch(&content, &outcomes, options.policy, &mut results, &mut committed);
        }
        stage = stage.max(ImportStage::Classified);

        if !options.policy.mutates() || committed.is_empty() {
            run.append_results(&results);
            return Ok(ImportReport { results, stage });
        }

        record_committed(&mut mapping, &committed[connection_count..], options);
        stage = ImportStage::Mapped;
        tracing::info!(recorded = committed.len(), "mapping updated");

        if let Some(policy) = options.wait {
            let guids: Vec<String> = committed.iter().map(|c| c.dest_guid.clone()).collect();
            let types: Vec<MetadataType> = committed
                .iter()
                .map(|c| c.content_type.metadata_type())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let waiter = ConsistencyWaiter::new(self.api, policy, self.ctx.cancel.clone());
            if let Err(err) = waiter.wait_until_visible(&guids, &types) {
                // Keep what was recorded so a retry resumes from here.
                mapping.persist()?;
                run.note(&format!("consistency wait failed: {err}"));
                run.append_results(&results);
                return Err(err);
            }
            stage = ImportStage::Consistent;
        }
        mapping.persist()?;

        if !options.tags.is_empty() || !options.share_with.is_empty() {
            self.post_process(&committed, options, &run);
            stage = ImportStage::PostProcessed;
        }

        run.append_results(&results);
        tracing::info!(stage = %stage, results = results.len(), "import finished");
        Ok(ImportReport { results, stage })
    }

    // ========================================================================
    // Connections
    // ========================================================================

    fn import_connections(
        &self,
        connections: &[ContentDocument],
        options: &ImportOptions,
        mapping: &GuidMappingStore,
        run: &RunLog,
        results: &mut Vec<MigrationResult>,
        committed: &mut Vec<Committed>,
    ) -> Result<(), MigrationError> {
        match options.policy {
            ImportPolicy::ValidateOnly => {
                tracing::warn!(
                    connections = connections.len(),
                    "connections have no validate-only mode; skipping them"
                );
                for c in connections {
                    results.push(
                        MigrationResult::new(
                            c.guid().unwrap_or_default(),
                            ContentType::Connection,
                            c.display_name(),
                            MigrationStatus::Warning,
                        )
                        .with_messages("connections cannot be validated; not submitted"),
                    );
                }
                return Ok(());
            }
            ImportPolicy::AllOrNone => tracing::warn!(
                "connections are imported one at a time; ALL_OR_NONE is applied as PARTIAL"
            ),
            ImportPolicy::Partial => {}
        }

        for original in connections {
            self.ctx.cancel.check()?;
            let source_guid = original.guid().unwrap_or_default().to_string();
            let target = mapping.resolve(&source_guid, &options.dest_env);

            let existing = if options.force_create || target.is_empty() {
                None
            } else {
                match self.fetch_connection(&target) {
                    Ok(existing) => existing,
                    Err(message) => {
                        results.push(MigrationResult::error(
                            &source_guid,
                            ContentType::Connection,
                            original.display_name(),
                            message,
                        ));
                        continue;
                    }
                }
            };

            let plan = reconcile(original, existing.as_ref());
            run.append_log(&plan.document, Some(&source_guid));
            let (outcome, route_guid) = match &plan.route {
                ConnectionRoute::Create => (self.api.create_connection(&plan.document), None),
                ConnectionRoute::Update { guid } => (
                    self.api.update_connection(guid, &plan.document),
                    Some(guid.clone()),
                ),
            };
            let outcome = outcome.unwrap_or_else(|err| ImportOutcome::error(err.to_string()));

            let mut result = classify(original, &outcome);
            if result.is_error() {
                tracing::warn!(guid = %source_guid, messages = ?result.messages, "connection import failed");
                results.push(result);
                continue;
            }
            if !plan.dropped_tables.is_empty() {
                result.status = MigrationStatus::Warning;
                for table in &plan.dropped_tables {
                    result
                        .messages
                        .push(format!("table {table} is not on the destination connection; left out"));
                }
            }
            match outcome.guid.or(route_guid) {
                Some(dest_guid) => committed.push(Committed {
                    source_guid,
                    dest_guid,
                    content_type: ContentType::Connection,
                }),
                None => tracing::warn!(guid = %source_guid, "no destination guid returned; mapping not updated"),
            }
            results.push(result);
        }
        Ok(())
    }

    /// The destination's current version of a connection, `None` if absent.
    /// Failures come back as a per-object message.
    fn fetch_connection(&self, guid: &str) -> Result<Option<ContentDocument>, String> {
        let body = match self.api.export_connection(guid) {
            Ok(body) => body,
            Err(ApiError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(format!("could not read the destination connection: {err}")),
        };
        let mut document = ContentDocument::from_value_as(ContentType::Connection, body)
            .map_err(|err| format!("destination connection is unreadable: {err}"))?;
        if document.guid().is_none() {
            document
                .set_guid(guid)
                .map_err(|err| format!("destination connection has a bad guid: {err}"))?;
        }
        Ok(Some(document))
    }

    // ========================================================================
    // Batched content
    // ========================================================================

    fn classify_batch(
        &self,
        originals: &[ContentDocument],
        outcomes: &[ImportOutcome],
        policy: ImportPolicy,
        results: &mut Vec<MigrationResult>,
        committed: &mut Vec<Committed>,
    ) {
        let any_error = outcomes.iter().any(|o| o.status.is_error());
        let rejected = policy == ImportPolicy::AllOrNone && any_error;
        if rejected {
            tracing::warn!("an object failed under ALL_OR_NONE; no mappings will be recorded");
        }

        for (original, outcome) in originals.iter().zip(outcomes) {
            let mut result = classify(original, outcome);
            if result.is_error() {
                tracing::warn!(
                    guid = %result.guid,
                    content_type = %result.content_type,
                    messages = ?result.messages,
                    "import failed"
                );
                results.push(result);
                continue;
            }
            if rejected {
                result.guid = original.guid().unwrap_or_default().to_string();
                result.status = MigrationStatus::Warning;
                result
                    .messages
                    .push("not committed: another object in the batch failed".to_string());
                results.push(result);
                continue;
            }
            if policy.mutates() {
                match (original.guid(), outcome.guid.as_deref()) {
                    (Some(source), Some(dest)) => committed.push(Committed {
                        source_guid: source.to_string(),
                        dest_guid: dest.to_string(),
                        content_type: original.content_type(),
                    }),
                    _ => tracing::warn!(
                        name = original.display_name(),
                        "missing source or destination guid; mapping not updated"
                    ),
                }
            }
            results.push(result);
        }
    }

    // ========================================================================
    // Post-processing
    // ========================================================================

    /// Tag and share committed objects. Failures are logged, never raised.
    fn post_process(&self, committed: &[Committed], options: &ImportOptions, run: &RunLog) {
        let mut groups: BTreeMap<MetadataType, Vec<String>> = BTreeMap::new();
        let mut connections = Vec::new();
        for c in committed {
            if c.content_type.is_connection() {
                connections.push(c.dest_guid.clone());
            } else {
                groups
                    .entry(c.content_type.metadata_type())
                    .or_default()
                    .push(c.dest_guid.clone());
            }
        }

        let report = |what: &str, err: ApiError| {
            tracing::warn!(error = %err, "{what} failed");
            run.note(&format!("{what} failed: {err}"));
        };

        for (metadata_type, guids) in &groups {
            if !options.tags.is_empty() {
                if let Err(err) = self.api.assign_tags(guids, *metadata_type, &options.tags) {
                    report(&format!("tagging {metadata_type}"), err);
                }
            }
            if !options.share_with.is_empty() {
                if let Err(err) = self.api.share(guids, *metadata_type, &options.share_with) {
                    report(&format!("sharing {metadata_type}"), err);
                }
            }
        }

        let share_connections = !options.share_with.is_empty() && !connections.is_empty();
        if share_connections && !self.ctx.supports_connection_sharing() {
            tracing::warn!(
                version = %self.ctx.platform_version,
                "platform cannot share connections; skipping"
            );
        }
        for guid in &connections {
            let one = std::slice::from_ref(guid);
            if !options.tags.is_empty() {
                if let Err(err) = self.api.assign_tags(one, MetadataType::Connection, &options.tags) {
                    report(&format!("tagging connection {guid}"), err);
                }
            }
            if share_connections && self.ctx.supports_connection_sharing() {
                if let Err(err) = self.api.share(one, MetadataType::Connection, &options.share_with) {
                    report(&format!("sharing connection {guid}"), err);
                }
            }
        }
    }
}

/// Map each committed object under its logical key, falling back to the
/// source GUID when the key is new.
fn record_committed(mapping: &mut GuidMappingStore, committed: &[Committed], options: &ImportOptions) {
    for c in committed {
        let key = mapping
            .logical_key_for(&options.source_env, &c.source_guid)
            .map(str::to_string)
            .unwrap_or_else(|| c.source_guid.clone());
        mapping.record(
            &key,
            &options.source_env,
            &c.source_guid,
            &options.dest_env,
            &c.dest_guid,
        );
    }
}

/// One result per submitted document. Failed objects keep their original
/// GUID; accepted ones report the destination GUID and canonical name.
fn classify(original: &ContentDocument, outcome: &ImportOutcome) -> MigrationResult {
    let original_guid = original.guid().unwrap_or_default();
    let name = outcome
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .unwrap_or(original.display_name());
    let guid = if outcome.status.is_error() {
        original_guid
    } else {
        outcome.guid.as_deref().unwrap_or(original_guid)
    };
    MigrationResult::new(guid, original.content_type(), name, outcome.status)
        .with_messages(&outcome.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ApiCall, FakeApi};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const WS1: &str = "2d5b3f8e-0001-4c4c-9d0e-1f4b1a2c3d4e";
    const WS2: &str = "2d5b3f8e-0002-4c4c-9d0e-1f4b1a2c3d4e";
    const WS3: &str = "2d5b3f8e-0003-4c4c-9d0e-1f4b1a2c3d4e";
    const ORDERS: &str = "0a7c5a4e-0001-4a6f-8b1e-6f0a3c9e2b10";
    const ORDERS_PROD: &str = "0a7c5a4e-aaaa-4a6f-8b1e-6f0a3c9e2b10";
    const CONN: &str = "7f1e4b1c-0001-4f5e-9a8b-0c1d2e3f4a5b";
    const CONN_PROD: &str = "7f1e4b1c-aaaa-4f5e-9a8b-0c1d2e3f4a5b";

    fn fast() -> Option<WaitPolicy> {
        Some(WaitPolicy {
            poll_interval: Duration::ZERO,
            timeout: Duration::from_secs(5),
        })
    }

    fn options(policy: ImportPolicy) -> ImportOptions {
        ImportOptions {
            wait: fast(),
            ..ImportOptions::new(policy, "dev", "prod")
        }
    }

    fn ctx(version: &str) -> MigrationContext {
        MigrationContext::new(version.parse().unwrap())
    }

    fn worksheet(guid: &str, name: &str, table: Option<&str>) -> ContentDocument {
        let tables: Vec<Value> = table
            .map(|t| vec![json!({ "name": "orders", "fqn": t })])
            .unwrap_or_default();
        ContentDocument::from_parts(
            ContentType::Worksheet,
            Some(guid),
            json!({ "name": name, "tables": tables }),
        )
        .unwrap()
    }

    fn connection(guid: &str, tables: &[&str], password: &str) -> ContentDocument {
        let tables: Vec<Value> = tables
            .iter()
            .map(|t| {
                json!({
                    "name": t,
                    "external_table": { "db_name": "DB", "schema_name": "PUBLIC", "table_name": t }
                })
            })
            .collect();
        ContentDocument::from_parts(
            ContentType::Connection,
            Some(guid),
            json!({
                "name": "warehouse",
                "properties": [ { "key": "password", "value": password } ],
                "table": tables
            }),
        )
        .unwrap()
    }

    fn root(docs: &[ContentDocument]) -> (TempDir, ContentFilesystem) {
        let dir = tempdir().unwrap();
        let fs = ContentFilesystem::initialize(dir.path()).unwrap();
        for doc in docs {
            fs.write(doc).unwrap();
        }
        (dir, fs)
    }

    fn reload(fs: &ContentFilesystem) -> GuidMappingStore {
        GuidMappingStore::load(&fs.mapping_path("dev", "prod"), "dev", "prod").unwrap()
    }

    fn fqn_of(doc: &ContentDocument) -> Option<String> {
        doc.references().into_iter().next().map(|r| r.value)
    }

    #[test]
    fn source_rejects_guid_with_type_filters() {
        assert!(matches!(
            ImportSource::new(Some(WS1.into()), vec![ContentType::Worksheet], vec![]),
            Err(MigrationError::InvalidSource(_))
        ));
        assert!(matches!(
            ImportSource::new(Some("sales".into()), vec![], vec![]),
            Err(MigrationError::InvalidSource(_))
        ));
        let scan = ImportSource::new(None, vec![], vec![ContentType::Connection]).unwrap();
        assert_eq!(scan.types().first(), Some(&ContentType::Table));
    }

    #[test]
    fn validate_only_mutates_nothing() {
        let (_dir, fs) = root(&[worksheet(WS1, "Sales", None), worksheet(WS2, "Returns", None)]);
        let api = FakeApi::new();
        let ctx = ctx("9.5.0");
        let mut opts = options(ImportPolicy::ValidateOnly);
        opts.tags = vec!["prod-ready".into()];

        let report = Importer::new(&api, &ctx)
            .import(&fs, &ImportSource::all(), &opts)
            .unwrap();

        assert_eq!(report.stage, ImportStage::Classified);
        assert_eq!(report.count(MigrationStatus::Ok), 2);
        assert!(!fs.mapping_path("dev", "prod").exists());
        assert!(api.calls().iter().all(|c| !c.is_mutation()));
        assert_eq!(api.object_count(), 0);
    }

    #[test]
    fn all_or_none_records_nothing_when_one_object_fails() {
        let (_dir, fs) = root(&[
            worksheet(WS1, "Sales", None),
            worksheet(WS2, "Returns", None),
            worksheet(WS3, "Broken", None),
        ]);
        let api = FakeApi::new();
        api.fail_import_named("Broken");
        let ctx = ctx("9.5.0");

        let report = Importer::new(&api, &ctx)
            .import(&fs, &ImportSource::all(), &options(ImportPolicy::AllOrNone))
            .unwrap();

        assert_eq!(report.stage, ImportStage::Classified);
        assert!(reload(&fs).is_empty());
        assert_eq!(report.count(MigrationStatus::Error), 1);
        assert_eq!(report.count(MigrationStatus::Warning), 2);
        let failed = report.results.iter().find(|r| r.is_error()).unwrap();
        assert_eq!(failed.guid, WS3);
        assert_eq!(
            failed.messages,
            vec!["Invalid TML", "Referenced table could not be found"]
        );
    }

    #[test]
    fn partial_records_exactly_the_successes() {
        let (_dir, fs) = root(&[
            worksheet(WS1, "Sales", None),
            worksheet(WS2, "Returns", None),
            worksheet(WS3, "Broken", None),
        ]);
        let api = FakeApi::new();
        api.fail_import_named("Broken");
        let ctx = ctx("9.5.0");

        let report = Importer::new(&api, &ctx)
            .import(&fs, &ImportSource::all(), &options(ImportPolicy::Partial))
            .unwrap();

        assert_eq!(report.stage, ImportStage::Consistent);
        let mapping = reload(&fs);
        assert_eq!(mapping.len(), 2);
        assert!(mapping.lookup(WS1, "prod").is_some());
        assert!(mapping.lookup(WS2, "prod").is_some());
        assert!(mapping.lookup(WS3, "prod").is_none());
    }

    #[test]
    fn reimport_overwrites_the_destination_guid() {
        let (_dir, fs) = root(&[worksheet(WS1, "Sales", None)]);
        let api = FakeApi::new();
        let ctx = ctx("9.5.0");
        let mut opts = options(ImportPolicy::Partial);
        opts.force_create = true;

        let first = Importer::new(&api, &ctx)
            .import(&fs, &ImportSource::all(), &opts)
            .unwrap();
        let second = Importer::new(&api, &ctx)
            .import(&fs, &ImportSource::all(), &opts)
            .unwrap();

        let first_guid = &first.results[0].guid;
        let second_guid = &second.results[0].guid;
        assert_ne!(first_guid, second_guid);

        let mapping = reload(&fs);
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.resolve(WS1, "prod"), *second_guid);
        assert_eq!(mapping.lookup(WS1, "dev"), Some(WS1));
    }

    #[test]
    fn unmapped_reference_passes_through_without_force_create() {
        let (_dir, fs) = root(&[worksheet(WS1, "Sales", Some(ORDERS))]);
        let api = FakeApi::new();
        let ctx = ctx("9.5.0");

        let report = Importer::new(&api, &ctx)
            .import(&fs, &ImportSource::all(), &options(ImportPolicy::Partial))
            .unwrap();

        let imported = api.document(&report.results[0].guid).unwrap();
        assert_eq!(fqn_of(&imported), Some(ORDERS.to_string()));
    }

    #[test]
    fn force_create_clears_unmapped_references() {
        let (_dir, fs) = root(&[worksheet(WS1, "Sales", Some(ORDERS))]);
        let api = FakeApi::new();
        let ctx = ctx("9.5.0");
        let mut opts = options(ImportPolicy::Partial);
        opts.force_create = true;

        let report = Importer::new(&api, &ctx)
            .import(&fs, &ImportSource::all(), &opts)
            .unwrap();

        let imported = api.document(&report.results[0].guid).unwrap();
        assert_eq!(fqn_of(&imported), None);
    }

    #[test]
    fn mapped_references_point_at_the_destination() {
        let (_dir, fs) = root(&[worksheet(WS1, "Sales", Some(ORDERS))]);
        let mut mapping = fs.get_or_create_mapping("dev", "prod").unwrap();
        mapping.record(ORDERS, "dev", ORDERS, "prod", ORDERS_PROD);
        mapping.persist().unwrap();
        let api = FakeApi::new();
        let ctx = ctx("9.5.0");

        let report = Importer::new(&api, &ctx)
            .import(&fs, &ImportSource::all(), &options(ImportPolicy::Partial))
            .unwrap();

        let imported = api.document(&report.results[0].guid).unwrap();
        assert_eq!(fqn_of(&imported), Some(ORDERS_PROD.to_string()));
        // The stored source document is untouched.
        assert_eq!(fqn_of(&fs.load_one(WS1).unwrap()), Some(ORDERS.to_string()));
    }

    #[test]
    fn short_response_fails_the_run() {
        let (_dir, fs) = root(&[worksheet(WS1, "Sales", None), worksheet(WS2, "Returns", None)]);
        let api = FakeApi::new();
        api.truncate_import_responses();
        let ctx = ctx("9.5.0");

        let err = Importer::new(&api, &ctx)
            .import(&fs, &ImportSource::all(), &options(ImportPolicy::Partial))
            .unwrap_err();

        assert!(matches!(err, MigrationError::ResponseMismatch { sent: 2, received: 1 }));
        assert!(reload(&fs).is_empty());
    }

    #[test]
    fn connection_mapping_survives_a_short_content_response() {
        let (_dir, fs) = root(&[
            connection(CONN, &["ORDERS"], "pw"),
            worksheet(WS1, "Sales", None),
            worksheet(WS2, "Returns", None),
        ]);
        let api = FakeApi::new();
        api.truncate_import_responses();
        let ctx = ctx("9.5.0");

        let err = Importer::new(&api, &ctx)
            .import(&fs, &ImportSource::all(), &options(ImportPolicy::Partial))
            .unwrap_err();

        assert!(matches!(err, MigrationError::ResponseMismatch { sent: 2, received: 1 }));
        let mapping = reload(&fs);
        let created = mapping.lookup(CONN, "prod").unwrap();
        assert!(api.document(created).is_some());
        assert!(mapping.lookup(WS1, "prod").is_none());
        assert!(mapping.lookup(WS2, "prod").is_none());
    }

    #[test]
    fn rerun_after_a_failed_batch_updates_the_connection() {
        let (_dir, fs) = root(&[
            connection(CONN, &["ORDERS"], "pw"),
            worksheet(WS1, "Sales", None),
            worksheet(WS2, "Returns", None),
        ]);
        let api = FakeApi::new();
        api.truncate_import_responses();
        let ctx = ctx("9.5.0");
        let importer = Importer::new(&api, &ctx);

        assert!(importer
            .import(&fs, &ImportSource::all(), &options(ImportPolicy::Partial))
            .is_err());
        assert!(importer
            .import(&fs, &ImportSource::all(), &options(ImportPolicy::Partial))
            .is_err());

        let calls = api.calls();
        let creates = calls
            .iter()
            .filter(|c| matches!(c, ApiCall::CreateConnection { .. }))
            .count();
        assert_eq!(creates, 1);
        let created = reload(&fs).lookup(CONN, "prod").unwrap().to_string();
        assert!(calls.contains(&ApiCall::UpdateConnection { guid: created }));
    }

    #[test]
    fn missing_password_fails_before_any_call() {
        let (_dir, fs) = root(&[connection(CONN, &["ORDERS"], ""), worksheet(WS1, "Sales", None)]);
        let api = FakeApi::new();
        let ctx = ctx("9.5.0");

        let err = Importer::new(&api, &ctx)
            .import(&fs, &ImportSource::all(), &options(ImportPolicy::Partial))
            .unwrap_err();

        assert!(matches!(err, MigrationError::MissingCredential { .. }));
        assert!(api.calls().is_empty());
    }

    #[test]
    fn connections_go_first_and_are_created_when_absent() {
        let (_dir, fs) = root(&[connection(CONN, &["ORDERS"], "pw"), worksheet(WS1, "Sales", None)]);
        let api = FakeApi::new();
        let ctx = ctx("9.5.0");

        let report = Importer::new(&api, &ctx)
            .import(&fs, &ImportSource::all(), &options(ImportPolicy::AllOrNone))
            .unwrap();

        let calls = api.calls();
        let create = calls
            .iter()
            .position(|c| matches!(c, ApiCall::CreateConnection { .. }))
            .unwrap();
        let batch = calls
            .iter()
            .position(|c| matches!(c, ApiCall::ImportTml { .. }))
            .unwrap();
        assert!(create < batch);
        assert_eq!(report.results[0].content_type, ContentType::Connection);
        assert!(reload(&fs).lookup(CONN, "prod").is_some());
    }

    #[test]
    fn connection_update_never_adds_tables() {
        let (_dir, fs) = root(&[connection(CONN, &["ORDERS", "NEW_TABLE"], "pw")]);
        let mut mapping = fs.get_or_create_mapping("dev", "prod").unwrap();
        mapping.record(CONN, "dev", CONN, "prod", CONN_PROD);
        mapping.persist().unwrap();
        let api = FakeApi::new();
        api.insert(connection(CONN_PROD, &["ORDERS"], "pw"), None, &[]);
        let ctx = ctx("9.5.0");

        let report = Importer::new(&api, &ctx)
            .import(&fs, &ImportSource::all(), &options(ImportPolicy::Partial))
            .unwrap();

        assert!(api.calls().contains(&ApiCall::UpdateConnection {
            guid: CONN_PROD.into()
        }));
        let tables: Vec<String> = api
            .document(CONN_PROD)
            .unwrap()
            .connection_tables()
            .into_iter()
            .map(|k| k.table)
            .collect();
        assert_eq!(tables, vec!["ORDERS"]);
        assert_eq!(report.results[0].status, MigrationStatus::Warning);
        assert!(report.results[0].messages[0].contains("NEW_TABLE"));
    }

    #[test]
    fn connections_are_skipped_when_validating() {
        let (_dir, fs) = root(&[connection(CONN, &["ORDERS"], "")]);
        let api = FakeApi::new();
        let ctx = ctx("9.5.0");

        let report = Importer::new(&api, &ctx)
            .import(&fs, &ImportSource::all(), &options(ImportPolicy::ValidateOnly))
            .unwrap();

        assert_eq!(report.results[0].status, MigrationStatus::Warning);
        assert!(api.calls().is_empty());
    }

    #[test]
    fn post_processing_covers_only_committed_objects() {
        let (_dir, fs) = root(&[
            connection(CONN, &[], "pw"),
            worksheet(WS1, "Sales", None),
            worksheet(WS2, "Broken", None),
        ]);
        let api = FakeApi::new();
        api.fail_import_named("Broken");
        let ctx = ctx("9.1.0");
        let mut opts = options(ImportPolicy::Partial);
        opts.tags = vec!["prod-ready".into()];
        opts.share_with = vec!["Analysts".parse().unwrap()];

        let report = Importer::new(&api, &ctx)
            .import(&fs, &ImportSource::all(), &opts)
            .unwrap();
        assert_eq!(report.stage, ImportStage::PostProcessed);

        let calls = api.calls();
        let tagged: Vec<&ApiCall> = calls
            .iter()
            .filter(|c| matches!(c, ApiCall::AssignTags { .. }))
            .collect();
        assert_eq!(tagged.len(), 2);
        assert!(tagged.iter().all(|c| match c {
            ApiCall::AssignTags { guids, .. } => guids.len() == 1,
            _ => false,
        }));
        // 9.1 cannot share connections: only the worksheet group is shared.
        let shared: Vec<&ApiCall> = calls
            .iter()
            .filter(|c| matches!(c, ApiCall::Share { .. }))
            .collect();
        assert_eq!(shared.len(), 1);
        assert!(matches!(
            shared[0],
            ApiCall::Share { metadata_type: MetadataType::LogicalTable, .. }
        ));
        assert_eq!(api.tags_of(WS1), vec!["prod-ready".to_string()]);
    }

    #[test]
    fn post_processing_failures_are_not_fatal() {
        let (_dir, fs) = root(&[worksheet(WS1, "Sales", None)]);
        let api = FakeApi::new();
        api.fail_post_processing();
        let ctx = ctx("9.5.0");
        let mut opts = options(ImportPolicy::Partial);
        opts.tags = vec!["prod-ready".into()];

        let report = Importer::new(&api, &ctx)
            .import(&fs, &ImportSource::all(), &opts)
            .unwrap();
        assert_eq!(report.stage, ImportStage::PostProcessed);
        assert_eq!(report.count(MigrationStatus::Ok), 1);
    }

    #[test]
    fn mapping_survives_a_consistency_timeout() {
        let (_dir, fs) = root(&[worksheet(WS1, "Sales", None)]);
        let api = FakeApi::new();
        api.set_visibility_delay(1_000);
        let ctx = ctx("9.5.0");
        let mut opts = options(ImportPolicy::Partial);
        opts.wait = Some(WaitPolicy {
            poll_interval: Duration::ZERO,
            timeout: Duration::ZERO,
        });

        let err = Importer::new(&api, &ctx)
            .import(&fs, &ImportSource::all(), &opts)
            .unwrap_err();

        assert!(matches!(err, MigrationError::ConsistencyTimeout { .. }));
        assert!(reload(&fs).lookup(WS1, "prod").is_some());
    }

    #[test]
    fn single_guid_source_imports_one_document() {
        let (_dir, fs) = root(&[worksheet(WS1, "Sales", None), worksheet(WS2, "Returns", None)]);
        let api = FakeApi::new();
        let ctx = ctx("9.5.0");
        let source = ImportSource::new(Some(WS2.into()), vec![], vec![]).unwrap();

        let report = Importer::new(&api, &ctx)
            .import(&fs, &source, &options(ImportPolicy::Partial))
            .unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].display_name, "Returns");
    }
}
