//! Operator-facing snapshot of the status table.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use era5_core::{AggregateTarget, ConsumerStatus, Month, MonthStatus};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::store::StatusStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerProgress {
    pub target: String,
    pub done: usize,
    pub in_progress: usize,
    /// Acquired but not picked up yet.
    pub waiting: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub months: usize,
    pub acquired: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub earliest: Option<Month>,
    pub latest_acquired: Option<Month>,
    pub consumers: Vec<ConsumerProgress>,
}

impl StatusSummary {
    pub fn from_rows(rows: &[MonthStatus], targets: &[AggregateTarget]) -> Self {
        let consumers = targets
            .iter()
            .map(|target| {
                let mut progress = ConsumerProgress {
                    target: target.name.clone(),
                    ..Default::default()
                };
                for row in rows.iter().filter(|r| r.is_acquired()) {
                    match row.consumer(&target.name) {
                        Some(ConsumerStatus::Done) => progress.done += 1,
                        Some(ConsumerStatus::InProgress) => progress.in_progress += 1,
                        None => progress.waiting += 1,
                    }
                }
                progress
            })
            .collect();

        Self {
            months: rows.len(),
            acquired: rows.iter().filter(|r| r.is_acquired()).count(),
            pending: rows.iter().filter(|r| !r.is_acquired() && !r.downloading).count(),
            in_flight: rows.iter().filter(|r| r.downloading).count(),
            earliest: rows.iter().map(|r| r.month).min(),
            latest_acquired: rows.iter().filter(|r| r.is_acquired()).map(|r| r.month).max(),
            consumers,
        }
    }

    pub fn to_markdown(&self, run_id: Uuid, generated_at: DateTime<Utc>) -> String {
        let month_or_dash = |m: Option<Month>| m.map(|m| m.to_string()).unwrap_or_else(|| "-".to_string());
        let consumers = self
            .consumers
            .iter()
            .map(|c| {
                format!(
                    "| {} | {} | {} | {} |",
                    c.target, c.done, c.in_progress, c.waiting
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "# ERA5 Acquisition Status\n\n- Run ID: `{run_id}`\n- Generated: {generated_at}\n- Months tracked: {}\n- Earliest month: {}\n- Acquired: {}\n- Pending: {}\n- In flight: {}\n- Latest acquired: {}\n\n## Consumers\n\n| target | done | in progress | waiting |\n|---|---|---|---|\n{consumers}\n",
            self.months,
            month_or_dash(self.earliest),
            self.acquired,
            self.pending,
            self.in_flight,
            month_or_dash(self.latest_acquired),
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub run_id: Uuid,
    pub reports_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub summary: StatusSummary,
}

/// Writes `reports/<run_id>/` with `status.md`, `month_status.parquet` and `manifest.json`.
pub async fn write_status_report<S>(store: &S, targets: &[AggregateTarget], workspace_root: &Path) -> Result<StatusReport>
where
    S: StatusStore + ?Sized,
{
    let run_id = Uuid::new_v4();
    let generated_at = Utc::now();
    let rows = store.list().await.context("listing month status")?;
    let summary = StatusSummary::from_rows(&rows, targets);

    let reports_dir = workspace_root.join("reports").join(run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join("status.md"), summary.to_markdown(run_id, generated_at))
        .await
        .context("writing status.md")?;

    let parquet_path = reports_dir.join("month_status.parquet");
    write_month_status_parquet(&parquet_path, &rows, targets)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        run_id,
        generated_at,
        files: vec![manifest_entry("month_status", &reports_dir, &parquet_path)?],
    };
    let manifest_path = reports_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(StatusReport {
        run_id,
        reports_dir,
        manifest_path,
        summary,
    })
}

fn write_month_status_parquet(path: &Path, rows: &[MonthStatus], targets: &[AggregateTarget]) -> Result<()> {
    let mut fields = vec![
        ArrowField::new("month", DataType::Utf8, false),
        ArrowField::new("path", DataType::Utf8, true),
        ArrowField::new("downloading", DataType::Boolean, false),
        ArrowField::new("downloading_since", DataType::Utf8, true),
    ];
    fields.extend(
        targets
            .iter()
            .map(|t| ArrowField::new(format!("{}_status", t.name), DataType::Utf8, true)),
    );
    let schema = Arc::new(Schema::new(fields));

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            rows.iter().map(|r| Some(r.month.to_string())).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.path.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(
            rows.iter().map(|r| r.downloading).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|r| r.downloading_since.map(|t| t.to_rfc3339()))
                .collect::<Vec<_>>(),
        )),
    ];
    for target in targets {
        columns.push(Arc::new(StringArray::from(
            rows.iter()
                .map(|r| r.consumer(&target.name).map(ConsumerStatus::as_str))
                .collect::<Vec<_>>(),
        )));
    }

    let batch = RecordBatch::try_new(schema, columns).context("building month_status record batch")?;
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

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}
