use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use pfin_core::{ColumnDef, ColumnType, Record, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::warn;

use crate::{SyncRunSummary, TableStatus, TableSyncReport};

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
pub const DAILY_BRIEF_FILE: &str = "daily_brief.md";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

pub(crate) async fn write_reports(reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    fs::write(reports_dir.join(DAILY_BRIEF_FILE), render_daily_brief(summary))
        .await
        .context("writing daily_brief.md")?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join(RUN_SUMMARY_FILE), json)
        .await
        .context("writing run_summary.json")?;
    Ok(())
}

pub fn render_daily_brief(summary: &SyncRunSummary) -> String {
    let rows = summary
        .tables
        .iter()
        .map(|t| {
            format!(
                "| {} | {} | {} | {} | {} | {} | {} | {} |",
                t.table,
                t.status.as_str(),
                t.fetched_rows,
                t.inserted,
                t.updated,
                t.duplicate_keys,
                t.prepare.dropped_rows,
                t.prepare.unmatched_rows,
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let failures = summary
        .tables
        .iter()
        .filter_map(|t| t.error.as_ref().map(|e| format!("- {}: {}", t.table, e)))
        .collect::<Vec<_>>();

    let mut brief = format!(
        "# pfin Daily Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Tables: {} ({} failed)\n- Inserted: {}\n- Updated: {}\n\n## Tables\n| table | status | fetched | inserted | updated | duplicate keys | dropped | unmatched |\n|---|---|---|---|---|---|---|---|\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.tables.len(),
        summary.failed_tables,
        summary.inserted,
        summary.updated,
        rows
    );
    if !failures.is_empty() {
        brief.push_str("\n## Failures\n");
        brief.push_str(&failures.join("\n"));
        brief.push('\n');
    }
    brief
}

/// Writes each synced table's insert and update sets as
/// `snapshots/<table>_{insert,update}.parquet` plus `snapshots/manifest.json`.
pub(crate) async fn export_parquet_deltas(reports_dir: &Path, tables: &[TableSyncReport]) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let mut files = Vec::new();
    for table in tables.iter().filter(|t| t.status == TableStatus::Synced) {
        for (set, records) in [("insert", &table.delta.inserted), ("update", &table.delta.updated)] {
            if records.is_empty() {
                continue;
            }
            let name = format!("{}_{set}", table.delta.table);
            let path = snapshot_dir.join(format!("{name}.parquet"));
            write_delta_parquet(&path, &table.delta.columns, records)?;
            files.push(manifest_entry(&name, reports_dir, &path, records.len())?);
        }
    }

    let manifest = ParquetManifest {
        schema_version: 1,
        files,
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

/// Lists the most recent runs under `<root>/reports`, newest first. Run
/// directories without a readable summary (an interrupted run) are skipped.
pub fn report_daily_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# pfin Report Daily".to_string(), String::new()];
    let mut listed = 0;
    for dir in dirs {
        if listed == runs.max(1) {
            break;
        }
        let run_id = dir.file_name().to_string_lossy().to_string();
        let summary_path = dir.path().join(RUN_SUMMARY_FILE);
        let daily_path = dir.path().join(DAILY_BRIEF_FILE);
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let summary = match read_run_summary(&summary_path) {
            Ok(summary) => summary,
            Err(err) => {
                warn!(run_id = %run_id, error = %format!("{err:#}"), "skipping run without a readable summary");
                continue;
            }
        };
        listed += 1;
        let count = |field: &str| summary.get(field).and_then(|v| v.as_u64()).unwrap_or(0);
        let failed: Vec<&str> = summary
            .get("tables")
            .and_then(|v| v.as_array())
            .map(|tables| {
                tables
                    .iter()
                    .filter(|t| t.get("status").and_then(|s| s.as_str()) == Some("failed"))
                    .filter_map(|t| t.get("table").and_then(|s| s.as_str()))
                    .collect()
            })
            .unwrap_or_default();

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- inserted: {}", count("inserted")));
        lines.push(format!("- updated: {}", count("updated")));
        if failed.is_empty() {
            lines.push("- failed tables: none".to_string());
        } else {
            lines.push(format!("- failed tables: {}", failed.join(", ")));
        }
        lines.push(format!("- summary: `{}`", summary_path.display()));
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        if daily_path.exists() {
            lines.push(format!("- daily brief: `{}`", daily_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

fn read_run_summary(path: &Path) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

/// Declared columns carried by at least one record, typed from the declaration.
/// Dates and timestamps are written as text.
fn write_delta_parquet(path: &Path, columns: &[ColumnDef], records: &[Record]) -> Result<()> {
    let mut fields = Vec::new();
    let mut arrays: Vec<ArrayRef> = Vec::new();
    for column in columns.iter().filter(|c| records.iter().any(|r| r.contains(&c.name))) {
        let values = records.iter().map(|r| r.value(&column.name));
        let (data_type, array): (DataType, ArrayRef) = match column.column_type {
            ColumnType::Bool => (
                DataType::Boolean,
                Arc::new(
                    values
                        .map(|v| match v {
                            Value::Bool(b) => Some(*b),
                            _ => None,
                        })
                        .collect::<BooleanArray>(),
                ),
            ),
            ColumnType::Int | ColumnType::BigInt => {
                (DataType::Int64, Arc::new(values.map(Value::as_i64).collect::<Int64Array>()))
            }
            ColumnType::Float | ColumnType::Numeric => {
                (DataType::Float64, Arc::new(values.map(Value::as_f64).collect::<Float64Array>()))
            }
            ColumnType::Text | ColumnType::Date | ColumnType::Timestamp => (
                DataType::Utf8,
                Arc::new(
                    values
                        .map(|v| (!v.is_null()).then(|| v.to_string()))
                        .collect::<StringArray>(),
                ),
            ),
        };
        fields.push(ArrowField::new(column.name.as_str(), data_type, true));
        arrays.push(array);
    }

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .with_context(|| format!("building record batch for {}", path.display()))?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TableDelta;
    use chrono::{NaiveDate, TimeZone, Utc};
    use uuid::Uuid;

    fn eod_columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef { name: "id".into(), column_type: ColumnType::BigInt },
            ColumnDef { name: "asset_id".into(), column_type: ColumnType::BigInt },
            ColumnDef { name: "end_date".into(), column_type: ColumnType::Date },
            ColumnDef { name: "close".into(), column_type: ColumnType::Numeric },
        ]
    }

    fn synced_eod() -> TableSyncReport {
        let day = NaiveDate::from_ymd_opt(2024, 8, 2).unwrap();
        let mut report = TableSyncReport::new("pfin", "eod_price");
        report.status = TableStatus::Synced;
        report.fetched_rows = 2;
        report.inserted = 1;
        report.updated = 1;
        report.delta = TableDelta {
            table: "eod_price".into(),
            columns: eod_columns(),
            inserted: vec![Record::from_pairs([
                ("asset_id", Value::Int(7)),
                ("end_date", Value::Date(day)),
                ("close", Value::Float(219.86)),
            ])],
            updated: vec![Record::from_pairs([
                ("asset_id", Value::Int(7)),
                ("end_date", Value::Date(day.pred_opt().unwrap())),
                ("close", Value::Null),
                ("id", Value::Int(41)),
            ])],
        };
        report
    }

    fn failed_earning() -> TableSyncReport {
        let mut report = TableSyncReport::new("pfin", "earning");
        report.status = TableStatus::Failed;
        report.error = Some("fmp-earnings: provider rejected request".into());
        report
    }

    fn summary(tables: Vec<TableSyncReport>) -> SyncRunSummary {
        let at = Utc.with_ymd_and_hms(2024, 8, 5, 6, 0, 0).single().unwrap();
        SyncRunSummary::new(Uuid::nil(), at, at, tables)
    }

    #[tokio::test]
    async fn parquet_deltas_are_listed_with_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = export_parquet_deltas(dir.path(), &[synced_eod(), failed_earning()])
            .await
            .unwrap();
        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        let names: Vec<_> = manifest.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["eod_price_insert", "eod_price_update"]);
        for file in &manifest.files {
            let bytes = std::fs::read(dir.path().join(&file.path)).unwrap();
            assert_eq!(file.bytes, bytes.len() as u64);
            assert_eq!(file.sha256.len(), 64);
            assert_eq!(file.rows, 1);
        }
    }

    #[test]
    fn daily_brief_lists_tables_and_failures() {
        let brief = render_daily_brief(&summary(vec![synced_eod(), failed_earning()]));
        assert!(brief.contains("- Tables: 2 (1 failed)"));
        assert!(brief.contains("| pfin.eod_price | synced | 2 | 1 | 1 | 0 | 0 | 0 |"));
        assert!(brief.contains("- pfin.earning: fmp-earnings: provider rejected request"));
    }

    #[tokio::test]
    async fn report_daily_reads_written_runs() {
        let root = tempfile::tempdir().unwrap();
        let reports_dir = root.path().join("reports").join(Uuid::nil().to_string());
        std::fs::create_dir_all(&reports_dir).unwrap();
        write_reports(&reports_dir, &summary(vec![synced_eod(), failed_earning()]))
            .await
            .unwrap();

        let markdown = report_daily_markdown(5, Some(root.path().to_path_buf())).unwrap();
        assert!(markdown.contains(&format!("## Run `{}`", Uuid::nil())));
        assert!(markdown.contains("- inserted: 1"));
        assert!(markdown.contains("- failed tables: pfin.earning"));
    }

    #[tokio::test]
    async fn report_daily_skips_runs_without_a_summary() {
        let root = tempfile::tempdir().unwrap();
        let complete = root.path().join("reports").join(Uuid::nil().to_string());
        std::fs::create_dir_all(&complete).unwrap();
        write_reports(&complete, &summary(vec![synced_eod()])).await.unwrap();

        let interrupted = root.path().join("reports").join("interrupted");
        std::fs::create_dir_all(interrupted.join("snapshots")).unwrap();
        let truncated = root.path().join("reports").join("truncated");
        std::fs::create_dir_all(&truncated).unwrap();
        std::fs::write(truncated.join(RUN_SUMMARY_FILE), "{\"run_id\":").unwrap();

        let markdown = report_daily_markdown(5, Some(root.path().to_path_buf())).unwrap();
        assert!(markdown.contains(&format!("## Run `{}`", Uuid::nil())));
        assert!(!markdown.contains("interrupted"));
        assert!(!markdown.contains("truncated"));

        // skipped directories do not use up the run budget
        let latest = report_daily_markdown(1, Some(root.path().to_path_buf())).unwrap();
        assert!(latest.contains(&format!("## Run `{}`", Uuid::nil())));
    }
}
