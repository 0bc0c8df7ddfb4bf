//! End-to-end tests for the content filesystem

use super::*;
use serde_json::json;
use tempfile::tempdir;
use tmlsync_content::{ContentDocument, ContentType, MigrationResult, MigrationStatus};

const WS_GUID: &str = "2d5b3f8e-6a57-4c4c-9d0e-1f4b1a2c3d4e";
const TABLE_GUID: &str = "0a7c5a4e-1111-4a6f-8b1e-6f0a3c9e2b10";

fn worksheet(guid: Option<&str>) -> ContentDocument {
    ContentDocument::from_parts(
        ContentType::Worksheet,
        guid,
        json!({ "name": "Sales", "tables": [ { "name": "orders", "fqn": TABLE_GUID } ] }),
    )
    .unwrap()
}

fn table() -> ContentDocument {
    ContentDocument::from_parts(
        ContentType::Table,
        Some(TABLE_GUID),
        json!({ "name": "orders", "db": "DB", "schema": "PUBLIC", "db_table": "ORDERS" }),
    )
    .unwrap()
}

#[test]
fn test_initialize_creates_layout() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("content");
    let fs = ContentFilesystem::initialize(&root).unwrap();

    assert!(root.join(FS_MARKER).is_file());
    assert!(root.join("mappings").is_dir());
    assert!(root.join("logs").is_dir());
    for t in ContentType::ALL {
        assert!(fs.type_dir(t).is_dir(), "missing directory for {t}");
    }

    // Idempotent.
    ContentFilesystem::initialize(&root).unwrap();
}

#[test]
fn test_initialize_rejects_file_root() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, "x").unwrap();

    let err = ContentFilesystem::initialize(&file).unwrap_err();
    assert!(matches!(err, StorageError::InvalidRoot { .. }));
}

#[test]
fn test_open_requires_existing_root() {
    let dir = tempdir().unwrap();
    let err = ContentFilesystem::open(dir.path().join("missing")).unwrap_err();
    assert!(matches!(err, StorageError::InvalidRoot { .. }));
}

#[test]
fn test_write_uses_guid_and_type_filename() {
    let dir = tempdir().unwrap();
    let fs = ContentFilesystem::initialize(dir.path()).unwrap();

    let path = fs.write(&worksheet(Some(WS_GUID))).unwrap();
    assert_eq!(
        path,
        dir.path()
            .join("worksheet")
            .join(format!("{WS_GUID}.worksheet.doc"))
    );

    // No temp files left behind next to the document.
    let names: Vec<String> = std::fs::read_dir(fs.type_dir(ContentType::Worksheet))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec![format!("{WS_GUID}.worksheet.doc")]);
}

#[test]
fn test_write_requires_guid() {
    let dir = tempdir().unwrap();
    let fs = ContentFilesystem::initialize(dir.path()).unwrap();
    let err = fs.write(&worksheet(None)).unwrap_err();
    assert!(matches!(err, StorageError::MissingGuid { .. }));
}

#[test]
fn test_load_all_skips_nonconforming_files() {
    let dir = tempdir().unwrap();
    let fs = ContentFilesystem::initialize(dir.path()).unwrap();
    fs.write(&worksheet(Some(WS_GUID))).unwrap();
    fs.write(&table()).unwrap();

    let ws_dir = fs.type_dir(ContentType::Worksheet);
    std::fs::write(ws_dir.join("README.md"), "notes").unwrap();
    std::fs::write(ws_dir.join("not-a-guid.worksheet.doc"), "{}").unwrap();
    // Right pattern, wrong directory.
    std::fs::write(
        ws_dir.join(format!("{TABLE_GUID}.table.doc")),
        table().to_pretty_string().unwrap(),
    )
    .unwrap();

    let docs: Vec<ContentDocument> = fs
        .load_all(&[ContentType::Worksheet])
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].guid(), Some(WS_GUID));

    let all: Vec<ContentDocument> = fs
        .load_all(&ContentType::ALL)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(all.len(), 2);
    // Type order follows the requested order.
    assert_eq!(all[0].content_type(), ContentType::Table);
}

#[test]
fn test_load_one_scans_every_type() {
    let dir = tempdir().unwrap();
    let fs = ContentFilesystem::initialize(dir.path()).unwrap();
    fs.write(&worksheet(Some(WS_GUID))).unwrap();

    let doc = fs.load_one(&WS_GUID.to_uppercase()).unwrap();
    assert_eq!(doc.content_type(), ContentType::Worksheet);

    let err = fs.load_one(TABLE_GUID).unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}

#[test]
fn test_loaded_document_takes_guid_from_filename_when_absent() {
    let dir = tempdir().unwrap();
    let fs = ContentFilesystem::initialize(dir.path()).unwrap();
    let doc = worksheet(None);
    std::fs::write(
        fs.document_path(ContentType::Worksheet, WS_GUID),
        doc.to_pretty_string().unwrap(),
    )
    .unwrap();

    let loaded = fs.load_one(WS_GUID).unwrap();
    assert_eq!(loaded.guid(), Some(WS_GUID));
}

#[test]
fn test_run_log_is_sequenced_and_copies_documents() {
    let dir = tempdir().unwrap();
    let fs = ContentFilesystem::initialize(dir.path()).unwrap();
    let run = fs.begin_run(RunKind::Import);

    let first = run.append_log(&worksheet(Some(WS_GUID)), Some(TABLE_GUID));
    let second = run.append_log(&table(), None);
    assert!(second > first);

    run.append_results(&[MigrationResult::new(
        WS_GUID,
        ContentType::Worksheet,
        "Sales",
        MigrationStatus::Ok,
    )]);

    let text = std::fs::read_to_string(run.log_path()).unwrap();
    assert!(text.contains("#00001"));
    assert!(text.contains("#00002"));
    assert!(text.contains("# results"));
    assert!(run
        .documents_dir()
        .join(format!("{TABLE_GUID}.worksheet.doc"))
        .is_file());
    assert!(run
        .documents_dir()
        .join(format!("{TABLE_GUID}.table.doc"))
        .is_file());
    assert!(run
        .log_path()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("import-"));
}

#[test]
fn test_two_runs_in_the_same_second_do_not_collide() {
    let dir = tempdir().unwrap();
    let fs = ContentFilesystem::initialize(dir.path()).unwrap();
    let a = fs.begin_run(RunKind::Export);
    let b = fs.begin_run(RunKind::Export);
    assert_ne!(a.log_path(), b.log_path());
}

#[test]
fn test_get_or_create_mapping_materializes_file() {
    let dir = tempdir().unwrap();
    let fs = ContentFilesystem::initialize(dir.path()).unwrap();

    let store = fs.get_or_create_mapping("dev", "prod").unwrap();
    assert!(store.is_empty());
    assert_eq!(store.path(), dir.path().join("mappings").join("dev-prod.json"));
    let text = std::fs::read_to_string(store.path()).unwrap();
    assert!(text.contains("generated-by"));
}

#[test]
fn test_mapping_csv_shares_the_sanitized_stem() {
    let dir = tempdir().unwrap();
    let fs = ContentFilesystem::initialize(dir.path()).unwrap();

    let json = fs.mapping_path("team/dev", "prod eu");
    let csv = fs.mapping_csv_path("team/dev", "prod eu");
    assert_eq!(csv.parent(), Some(fs.mappings_dir().as_path()));
    assert_eq!(csv.file_stem(), json.file_stem());
    assert_eq!(csv.file_name().unwrap(), "team_dev-prod_eu.csv");
}

#[test]
fn test_mapping_last_writer_wins_without_duplicates() {
    let dir = tempdir().unwrap();
    let fs = ContentFilesystem::initialize(dir.path()).unwrap();
    let mut store = fs.get_or_create_mapping("dev", "prod").unwrap();

    store.record(WS_GUID, "dev", WS_GUID, "prod", TABLE_GUID);
    store.record(&WS_GUID.to_uppercase(), "dev", WS_GUID, "prod", "second");
    assert_eq!(store.len(), 1);
    assert_eq!(store.resolve(WS_GUID, "prod"), "second");
    assert_eq!(store.logical_key_for("prod", "SECOND"), Some(WS_GUID));
    store.persist().unwrap();

    let reloaded = fs.get_or_create_mapping("dev", "prod").unwrap();
    assert_eq!(reloaded.resolve(WS_GUID, "prod"), "second");
    assert_eq!(reloaded.resolve(WS_GUID, "dev"), WS_GUID);
}

#[test]
fn test_record_batch_applies_in_order() {
    let dir = tempdir().unwrap();
    let mut store = GuidMappingStore::new(dir.path().join("m.json"), "dev", "prod");
    let pair = |key: &str, dest: &str| MappingPair {
        logical_key: key.to_string(),
        source_env: "dev".to_string(),
        source_guid: key.to_string(),
        dest_env: "prod".to_string(),
        dest_guid: dest.to_string(),
    };
    let applied = store.record_batch(vec![pair("a", "1"), pair("b", "2"), pair("a", "3")]);
    assert_eq!(applied, 3);
    assert_eq!(store.len(), 2);
    assert_eq!(store.resolve("a", "prod"), "3");
    assert!(store.is_dirty());
}

#[test]
fn test_persist_failure_is_reported() {
    let dir = tempdir().unwrap();
    // Parent "directory" is a regular file, so the write must fail.
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "x").unwrap();
    let mut store = GuidMappingStore::new(blocker.join("m.json"), "dev", "prod");
    store.record("a", "dev", "a", "prod", "b");

    let err = store.persist().unwrap_err();
    assert!(matches!(err, StorageError::Persist { .. }));
    assert!(store.is_dirty());
}

#[test]
fn test_malformed_mapping_file_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("m.json");
    std::fs::write(&path, "{ not json").unwrap();
    let err = GuidMappingStore::load(&path, "dev", "prod").unwrap_err();
    assert!(matches!(err, StorageError::MappingFormat { .. }));
}
