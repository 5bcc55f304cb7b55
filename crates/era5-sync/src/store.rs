//! Store contracts shared by the Postgres backend and the in-process backend.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use era5_core::{AggregateTarget, Cadence, Month, MonthStatus};

use crate::error::StoreError;

/// Rows found in an aggregate table for one month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthCount {
    pub month: Month,
    pub rows: i64,
}

/// The month status table.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn month_count(&self) -> Result<i64, StoreError>;

    /// Inserts the months not yet present; returns how many were created.
    async fn insert_months(&self, months: &[Month]) -> Result<u64, StoreError>;

    /// `MAX(date) WHERE path IS NOT NULL`
    async fn latest_acquired(&self) -> Result<Option<Month>, StoreError>;

    /// `MAX(date) WHERE path IS NULL AND NOT downloading`
    async fn latest_pending(&self) -> Result<Option<Month>, StoreError>;

    /// Sets `downloading` only if the row exists, is not in flight and has no artifact.
    /// Must be a single conditional write: at most one concurrent caller gets `true`.
    async fn try_claim(&self, month: Month, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Sets `path` and clears `downloading` in the same write.
    async fn record_artifact(&self, month: Month, path: &str) -> Result<(), StoreError>;

    /// Clears `downloading`. Idempotent.
    async fn release(&self, month: Month) -> Result<(), StoreError>;

    /// Clears `downloading` on rows claimed before `claimed_before` (or with no claim time).
    async fn release_stale(&self, claimed_before: DateTime<Utc>) -> Result<Vec<Month>, StoreError>;

    async fn get(&self, month: Month) -> Result<Option<MonthStatus>, StoreError>;

    async fn list(&self) -> Result<Vec<MonthStatus>, StoreError>;

    /// null -> in_progress, only for acquired months.
    async fn begin_consume(&self, target: &AggregateTarget, month: Month) -> Result<bool, StoreError>;

    /// in_progress -> done.
    async fn finish_consume(&self, target: &AggregateTarget, month: Month) -> Result<bool, StoreError>;

    /// Most recent acquired month the target has not consumed yet.
    async fn next_unconsumed(&self, target: &AggregateTarget) -> Result<Option<Month>, StoreError>;

    async fn load_cadence(&self, task: &str) -> Result<Option<Cadence>, StoreError>;

    async fn save_cadence(&self, task: &str, cadence: Cadence) -> Result<(), StoreError>;
}

/// Downstream aggregate tables, as seen by the reconciler.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn monthly_counts(&self, target: &AggregateTarget) -> Result<Vec<MonthCount>, StoreError>;

    /// Months whose status column for `target` is `done`.
    async fn done_months(&self, target: &AggregateTarget) -> Result<Vec<Month>, StoreError>;

    /// Deletes the target's rows dated within `month` and nulls the target's status
    /// column for `month`, atomically. Returns the number of deleted rows.
    async fn purge_month(&self, target: &AggregateTarget, month: Month) -> Result<u64, StoreError>;
}

pub trait Store: StatusStore + AggregateStore {}

impl<T: StatusStore + AggregateStore + ?Sized> Store for T {}

/// Runs a store operation under `limit`.
pub async fn bounded<T, E, F>(limit: Duration, op: &'static str, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<StoreError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { op, limit }.into()),
    }
}

/// Quotes a possibly schema-qualified identifier after validating each part.
pub fn quote_ident(ident: &str) -> Result<String, StoreError> {
    let parts = ident.split('.').collect::<Vec<_>>();
    if parts.len() > 2 {
        return Err(StoreError::InvalidIdentifier(ident.to_string()));
    }
    let mut quoted = Vec::with_capacity(parts.len());
    for part in parts {
        let mut chars = part.chars();
        let valid_start = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::InvalidIdentifier(ident.to_string()));
        }
        quoted.push(format!("\"{part}\""));
    }
    Ok(quoted.join("."))
}
