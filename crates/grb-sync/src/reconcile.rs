//! Read-only drift report between the canonical store and the history ledger.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use strsim::jaro_winkler;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::store::{GrabStore, StoreError};

pub const DEFAULT_SAMPLE_LIMIT: i64 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct InstanceCount {
    pub instance: String,
    pub count: i64,
}

/// Ledger identity with no canonical row: a backfill candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct MissingInCanonical {
    pub instance: String,
    pub download_id: String,
    pub source_title: Option<String>,
    pub indexer: Option<String>,
    pub grabbed_at: Option<String>,
}

/// Canonical identity never observed in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct MissingInLedger {
    pub instance: String,
    pub download_id: String,
    pub title: String,
    pub first_seen_source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TitleMismatch {
    pub instance: String,
    pub download_id: String,
    pub canonical_title: String,
    pub ledger_title: String,
    /// Jaro-Winkler similarity of the lowercased titles.
    pub similarity: f64,
}

#[derive(Debug, FromRow)]
struct TitleMismatchRow {
    instance: String,
    download_id: String,
    canonical_title: String,
    ledger_title: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub generated_at: DateTime<Utc>,
    pub sample_limit: i64,
    pub missing_in_canonical: Vec<InstanceCount>,
    pub missing_in_canonical_total: i64,
    pub samples_missing_in_canonical: Vec<MissingInCanonical>,
    pub missing_in_ledger: i64,
    pub samples_missing_in_ledger: Vec<MissingInLedger>,
    pub mismatched_titles: Vec<TitleMismatch>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.missing_in_canonical_total == 0
            && self.missing_in_ledger == 0
            && self.mismatched_titles.is_empty()
    }
}

const LEDGER_ONLY: &str = "FROM grab_history hs \
     LEFT JOIN grabs g ON g.instance = hs.instance AND g.download_id = hs.download_id \
     WHERE hs.download_id IS NOT NULL AND trim(hs.download_id) != '' \
     AND g.id IS NULL \
     AND (hs.event_type IS NULL OR lower(hs.event_type) = 'grabbed')";

const CANONICAL_ONLY: &str = "FROM grabs g \
     WHERE g.download_id IS NOT NULL AND trim(g.download_id) != '' \
     AND NOT EXISTS (SELECT 1 FROM grab_history hs \
     WHERE hs.instance = g.instance AND hs.download_id = g.download_id)";

/// Compare both stores on the canonical identity `(instance, download_id)`.
pub async fn build_report(store: &GrabStore, limit: i64) -> Result<ReconciliationReport, StoreError> {
    store.ensure_schema().await?;
    let pool = store.pool();
    let limit = limit.max(1);

    let missing_in_canonical: Vec<InstanceCount> = sqlx::query_as(&format!(
        "SELECT hs.instance AS instance, COUNT(DISTINCT hs.download_id) AS count {LEDGER_ONLY} \
         GROUP BY hs.instance ORDER BY hs.instance"
    ))
    .fetch_all(pool)
    .await?;

    let samples_missing_in_canonical: Vec<MissingInCanonical> = sqlx::query_as(&format!(
        "SELECT hs.instance, hs.download_id, hs.source_title, hs.indexer, hs.grabbed_at {LEDGER_ONLY} \
         ORDER BY hs.grabbed_at DESC, hs.id DESC LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let missing_in_ledger: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(DISTINCT g.instance || '|' || g.download_id) {CANONICAL_ONLY}"
    ))
    .fetch_one(pool)
    .await?;

    let samples_missing_in_ledger: Vec<MissingInLedger> = sqlx::query_as(&format!(
        "SELECT g.instance, g.download_id, g.title, g.first_seen_source {CANONICAL_ONLY} \
         ORDER BY g.grabbed_at DESC, g.id DESC LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mismatch_rows: Vec<TitleMismatchRow> = sqlx::query_as(
        "SELECT hs.instance AS instance, hs.download_id AS download_id, \
         g.title AS canonical_title, hs.source_title AS ledger_title \
         FROM grab_history hs \
         JOIN grabs g ON g.instance = hs.instance AND g.download_id = hs.download_id \
         WHERE hs.source_title IS NOT NULL AND lower(hs.source_title) != lower(g.title) \
         ORDER BY hs.grabbed_at DESC, hs.id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mismatched_titles = mismatch_rows
        .into_iter()
        .map(|row| TitleMismatch {
            similarity: jaro_winkler(
                &row.canonical_title.to_lowercase(),
                &row.ledger_title.to_lowercase(),
            ),
            instance: row.instance,
            download_id: row.download_id,
            canonical_title: row.canonical_title,
            ledger_title: row.ledger_title,
        })
        .collect();

    Ok(ReconciliationReport {
        generated_at: store.clock().now(),
        sample_limit: limit,
        missing_in_canonical_total: missing_in_canonical.iter().map(|c| c.count).sum(),
        missing_in_canonical,
        samples_missing_in_canonical,
        missing_in_ledger,
        samples_missing_in_ledger,
        mismatched_titles,
    })
}

pub fn render_markdown(report: &ReconciliationReport) -> String {
    let mut lines = vec![
        "# GRB Reconciliation".to_string(),
        String::new(),
        format!("- Generated: {}", report.generated_at.to_rfc3339()),
        format!("- Missing in canonical store: {}", report.missing_in_canonical_total),
        format!("- Missing in history ledger: {}", report.missing_in_ledger),
        format!("- Mismatched titles: {}", report.mismatched_titles.len()),
        String::new(),
        "## Missing In Canonical Store".to_string(),
    ];
    if report.missing_in_canonical.is_empty() {
        lines.push("- none".to_string());
    }
    for count in &report.missing_in_canonical {
        lines.push(format!("- {}: {}", count.instance, count.count));
    }
    for sample in &report.samples_missing_in_canonical {
        lines.push(format!(
            "  - `{}` {} ({})",
            sample.download_id,
            sample.source_title.as_deref().unwrap_or("untitled"),
            sample.instance
        ));
    }

    lines.push(String::new());
    lines.push("## Missing In History Ledger".to_string());
    if report.samples_missing_in_ledger.is_empty() {
        lines.push("- none".to_string());
    }
    for sample in &report.samples_missing_in_ledger {
        lines.push(format!(
            "- `{}` {} ({}, first seen via {})",
            sample.download_id, sample.title, sample.instance, sample.first_seen_source
        ));
    }

    lines.push(String::new());
    lines.push("## Mismatched Titles".to_string());
    if report.mismatched_titles.is_empty() {
        lines.push("- none".to_string());
    }
    for mismatch in &report.mismatched_titles {
        lines.push(format!(
            "- `{}` ({}): canonical \"{}\" vs ledger \"{}\" (similarity {:.2})",
            mismatch.download_id,
            mismatch.instance,
            mismatch.canonical_title,
            mismatch.ledger_title,
            mismatch.similarity
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportBundle {
    pub run_id: String,
    pub dir: PathBuf,
    pub manifest_path: PathBuf,
}

/// Write `<reports_dir>/<run_id>/` with markdown, JSON, parquet snapshots and
/// a checksummed manifest.
pub async fn write_report_bundle(report: &ReconciliationReport, reports_dir: &Path) -> Result<ReportBundle> {
    let run_id = Uuid::new_v4().to_string();
    let dir = reports_dir.join(&run_id);
    let snapshot_dir = dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    fs::write(dir.join("reconciliation.md"), render_markdown(report))
        .await
        .context("writing reconciliation.md")?;
    let json = serde_json::to_vec_pretty(&serde_json::json!({
        "run_id": run_id,
        "report": report,
    }))
    .context("serializing reconciliation report")?;
    fs::write(dir.join("reconciliation.json"), json)
        .await
        .context("writing reconciliation.json")?;

    let mismatches_path = snapshot_dir.join("title_mismatches.parquet");
    let missing_path = snapshot_dir.join("missing_in_canonical.parquet");
    write_title_mismatches_parquet(&mismatches_path, &report.mismatched_titles)?;
    write_missing_in_canonical_parquet(&missing_path, &report.samples_missing_in_canonical)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        run_id: run_id.clone(),
        files: vec![
            manifest_entry("title_mismatches", &dir, &mismatches_path)?,
            manifest_entry("missing_in_canonical", &dir, &missing_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(run_id = %run_id, dir = %dir.display(), "reconciliation report written");
    Ok(ReportBundle {
        run_id,
        dir,
        manifest_path,
    })
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

fn write_title_mismatches_parquet(path: &Path, rows: &[TitleMismatch]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("instance", DataType::Utf8, false),
        ArrowField::new("download_id", DataType::Utf8, false),
        ArrowField::new("canonical_title", DataType::Utf8, false),
        ArrowField::new("ledger_title", DataType::Utf8, false),
        ArrowField::new("similarity", DataType::Float64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.instance.as_str()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.download_id.as_str()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.canonical_title.as_str()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.ledger_title.as_str()))),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.similarity).collect::<Vec<_>>())),
        ],
    )
    .context("building title_mismatches record batch")?;
    write_parquet(path, batch)
}

fn write_missing_in_canonical_parquet(path: &Path, rows: &[MissingInCanonical]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("instance", DataType::Utf8, false),
        ArrowField::new("download_id", DataType::Utf8, false),
        ArrowField::new("source_title", DataType::Utf8, true),
        ArrowField::new("indexer", DataType::Utf8, true),
        ArrowField::new("grabbed_at", DataType::Utf8, true),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.instance.as_str()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.download_id.as_str()))),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.source_title.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.indexer.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.grabbed_at.as_deref()).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building missing_in_canonical record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, base_dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path
        .strip_prefix(base_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}
