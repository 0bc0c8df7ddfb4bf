//! Human-facing output: the results table and the mapping-details CSV.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use colored::{ColoredString, Colorize};
use tmlsync_content::{MigrationResult, MigrationStatus};
use tmlsync_migrate::ContentHeader;
use tmlsync_storage::GuidMappingStore;

const NAME_WIDTH: usize = 40;

fn status_cell(status: MigrationStatus) -> ColoredString {
    let cell = format!("{:<7}", status.as_str());
    match status {
        MigrationStatus::Ok => cell.green(),
        MigrationStatus::Warning => cell.yellow(),
        MigrationStatus::Error => cell.red(),
    }
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let mut out: String = s.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

pub fn print_results(results: &[MigrationResult]) {
    if results.is_empty() {
        println!("{}", "no objects processed".dimmed());
        return;
    }
    println!(
        "{}",
        format!(
            "{:<7}  {:<36}  {:<10}  {:<NAME_WIDTH$}  MESSAGES",
            "STATUS", "GUID", "TYPE", "NAME"
        )
        .bold()
    );
    for r in results {
        println!(
            "{}  {:<36}  {:<10}  {:<NAME_WIDTH$}  {}",
            status_cell(r.status),
            r.guid,
            r.content_type.as_str(),
            truncate(&r.display_name, NAME_WIDTH),
            r.messages.join(" | ")
        );
    }
    let count = |s: MigrationStatus| results.iter().filter(|r| r.status == s).count();
    println!(
        "\n{} ok, {} warning, {} error",
        count(MigrationStatus::Ok).to_string().green(),
        count(MigrationStatus::Warning).to_string().yellow(),
        count(MigrationStatus::Error).to_string().red()
    );
}

// ============================================================================
// mapping-details
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingRow {
    pub logical_key: String,
    pub source_guid: String,
    pub source_name: String,
    pub source_type: String,
    pub dest_guid: String,
    pub dest_name: String,
    pub dest_type: String,
}

pub const CSV_HEADER: &str =
    "logical_key,source_guid,source_name,source_type,dest_guid,dest_name,dest_type";

/// One row per logical key. Names and types come from `source` and `dest`
/// (keyed by lowercased GUID) and are left blank when unknown.
pub fn mapping_rows(
    mapping: &GuidMappingStore,
    source: &BTreeMap<String, ContentHeader>,
    dest: &BTreeMap<String, ContentHeader>,
) -> Vec<MappingRow> {
    let describe = |names: &BTreeMap<String, ContentHeader>, guid: &str| {
        names
            .get(&guid.to_ascii_lowercase())
            .map(|h| (h.name.clone(), h.content_type.as_str().to_string()))
            .unwrap_or_default()
    };
    mapping
        .entries()
        .map(|(key, envs)| {
            let source_guid = envs.get(mapping.source_env()).cloned().unwrap_or_default();
            let dest_guid = envs.get(mapping.dest_env()).cloned().unwrap_or_default();
            let (source_name, source_type) = describe(source, &source_guid);
            let (dest_name, dest_type) = describe(dest, &dest_guid);
            MappingRow {
                logical_key: key.to_string(),
                source_guid,
                source_name,
                source_type,
                dest_guid,
                dest_name,
                dest_type,
            }
        })
        .collect()
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn render_csv(rows: &[MappingRow]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for row in rows {
        let fields = [
            &row.logical_key,
            &row.source_guid,
            &row.source_name,
            &row.source_type,
            &row.dest_guid,
            &row.dest_name,
            &row.dest_type,
        ];
        let line: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

pub fn write_csv(path: &Path, rows: &[MappingRow]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, render_csv(rows))
        .with_context(|| format!("failed to write {}", path.display()))
}

pub fn print_mapping(rows: &[MappingRow]) {
    if rows.is_empty() {
        println!("{}", "mapping is empty".dimmed());
        return;
    }
    println!(
        "{}",
        format!("{:<36}  {:<36}  {:<36}  NAME", "LOGICAL KEY", "SOURCE", "DEST").bold()
    );
    for row in rows {
        let dest = if row.dest_guid.is_empty() {
            "-".dimmed().to_string()
        } else {
            row.dest_guid.clone()
        };
        let name = if row.dest_name.is_empty() {
            &row.source_name
        } else {
            &row.dest_name
        };
        println!(
            "{:<36}  {:<36}  {:<36}  {}",
            row.logical_key,
            row.source_guid,
            dest,
            truncate(name, NAME_WIDTH)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmlsync_content::ContentType;

    const SRC: &str = "2d5b3f8e-0001-4c4c-9d0e-1f4b1a2c3d4e";
    const DST: &str = "2d5b3f8e-aaaa-4c4c-9d0e-1f4b1a2c3d4e";

    fn header(guid: &str, name: &str) -> ContentHeader {
        ContentHeader {
            guid: guid.to_string(),
            name: name.to_string(),
            content_type: ContentType::Worksheet,
            author: None,
            tags: Vec::new(),
        }
    }

    #[test]
    fn fields_with_separators_are_quoted() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("Sales, EMEA"), "\"Sales, EMEA\"");
        assert_eq!(csv_field("the \"best\""), "\"the \"\"best\"\"\"");
    }

    #[test]
    fn rows_resolve_names_on_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let mut mapping = GuidMappingStore::new(dir.path().join("dev-prod.json"), "dev", "prod");
        mapping.record(SRC, "dev", SRC, "prod", DST);

        let source = BTreeMap::from([(SRC.to_string(), header(SRC, "Sales, EMEA"))]);
        let rows = mapping_rows(&mapping, &source, &BTreeMap::new());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].dest_guid, DST);
        assert_eq!(rows[0].source_type, "worksheet");
        assert!(rows[0].dest_name.is_empty());

        let csv = render_csv(&rows);
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        assert_eq!(
            lines.next(),
            Some(format!("{SRC},{SRC},\"Sales, EMEA\",worksheet,{DST},,").as_str())
        );
    }

    #[test]
    fn csv_is_written_under_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mappings").join("dev-prod.csv");
        write_csv(&path, &[]).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), format!("{CSV_HEADER}\n"));
    }
}
