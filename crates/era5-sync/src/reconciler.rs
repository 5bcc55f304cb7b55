//! Audits aggregate tables for months whose row count misses the target density
//! and purges them so downstream consumers reprocess the month.
//!
//! Only consumer status is reset. `path` and `downloading` are left alone: the
//! artifact is assumed valid, so a purged month is re-consumed, not re-downloaded.

use std::collections::HashSet;
use std::time::Duration;

use era5_core::{AggregateTarget, Month};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::StoreError;
use crate::store::{bounded, AggregateStore, MonthCount};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgedMonth {
    pub month: Month,
    pub expected: i64,
    pub found: i64,
    pub deleted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetReconcile {
    pub target: String,
    pub months_checked: usize,
    pub purged: Vec<PurgedMonth>,
    /// Months whose purge failed; they stay as they were and are retried next pass.
    pub failed: Vec<(Month, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub targets: Vec<TargetReconcile>,
    /// Targets that could not be audited at all.
    pub errors: Vec<(String, String)>,
}

impl ReconcileReport {
    pub fn purged_months(&self) -> usize {
        self.targets.iter().map(|t| t.purged.len()).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.targets.iter().all(|t| t.failed.is_empty())
    }
}

/// Adds a zero count for every `done` month that has no aggregate rows left.
/// An `in_progress` month with no rows is left alone: its load may not have started.
pub fn with_emptied_done_months(mut counts: Vec<MonthCount>, done: &[Month]) -> Vec<MonthCount> {
    let counted = counts.iter().map(|c| c.month).collect::<HashSet<_>>();
    counts.extend(
        done.iter()
            .filter(|m| !counted.contains(*m))
            .map(|&month| MonthCount { month, rows: 0 }),
    );
    counts.sort_by_key(|c| c.month);
    counts
}

/// Months whose row count differs from the target's expected density.
pub fn incomplete_months(target: &AggregateTarget, counts: &[MonthCount]) -> Vec<(Month, i64, i64)> {
    counts
        .iter()
        .filter_map(|c| {
            let expected = target.expected_rows(c.month);
            (c.rows != expected).then_some((c.month, expected, c.rows))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    targets: Vec<AggregateTarget>,
    store_timeout: Duration,
}

impl Reconciler {
    pub fn new(targets: Vec<AggregateTarget>, store_timeout: Duration) -> Self {
        Self { targets, store_timeout }
    }

    /// Audits every target independently; one failing target never stops the others.
    pub async fn run<S>(&self, store: &S) -> ReconcileReport
    where
        S: AggregateStore + ?Sized,
    {
        let mut report = ReconcileReport::default();
        for target in &self.targets {
            match self.reconcile_target(store, target).await {
                Ok(result) => report.targets.push(result),
                Err(err) => {
                    error!(target = %target.name, error = %err, "reconcile pass failed");
                    report.errors.push((target.name.clone(), err.to_string()));
                }
            }
        }
        info!(
            targets = report.targets.len(),
            purged = report.purged_months(),
            errors = report.errors.len(),
            "reconcile pass finished"
        );
        report
    }

    pub async fn reconcile_target<S>(&self, store: &S, target: &AggregateTarget) -> Result<TargetReconcile, StoreError>
    where
        S: AggregateStore + ?Sized,
    {
        let counts = bounded(self.store_timeout, "monthly_counts", store.monthly_counts(target)).await?;
        let done = bounded(self.store_timeout, "done_months", store.done_months(target)).await?;
        let counts = with_emptied_done_months(counts, &done);
        let mut result = TargetReconcile {
            target: target.name.clone(),
            months_checked: counts.len(),
            purged: Vec::new(),
            failed: Vec::new(),
        };

        for (month, expected, found) in incomplete_months(target, &counts) {
            warn!(target = %target.name, %month, expected, found, "incomplete month; purging");
            match bounded(self.store_timeout, "purge_month", store.purge_month(target, month)).await {
                Ok(deleted) => result.purged.push(PurgedMonth {
                    month,
                    expected,
                    found,
                    deleted,
                }),
                Err(err) => {
                    error!(target = %target.name, %month, error = %err, "purge failed");
                    result.failed.push((month, err.to_string()));
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::StatusStore;
    use chrono::{Duration as Days, NaiveDate};
    use era5_core::ConsumerStatus;

    fn month(y: i32, m: u32) -> Month {
        Month::from_ymd(y, m).unwrap()
    }

    /// Ten spatial units, one sample a day: 300 rows for a 30-day month.
    fn dense_target(name: &str) -> AggregateTarget {
        AggregateTarget {
            name: name.to_string(),
            table: format!("weather.{name}"),
            timestamp_column: "date".to_string(),
            status_column: name.to_string(),
            spatial_units: 10,
            samples_per_day: 1,
        }
    }

    fn rows_for(m: Month, count: usize) -> Vec<NaiveDate> {
        (0..count)
            .map(|i| m.first_day() + Days::days((i % m.days_in_month() as usize) as i64))
            .collect()
    }

    async fn consumed(store: &MemoryStore, target: &AggregateTarget, m: Month) {
        assert!(store.begin_consume(target, m).await.unwrap());
        assert!(store.finish_consume(target, m).await.unwrap());
    }

    #[test]
    fn density_mismatch_is_detected_both_ways() {
        let target = dense_target("brasil");
        let counts = vec![
            MonthCount { month: month(2023, 9), rows: 300 },
            MonthCount { month: month(2023, 11), rows: 280 },
            MonthCount { month: month(2023, 6), rows: 310 },
        ];
        let found = incomplete_months(&target, &counts);
        assert_eq!(
            found,
            vec![(month(2023, 11), 300, 280), (month(2023, 6), 300, 310)]
        );
    }

    #[tokio::test]
    async fn partial_month_is_purged_and_reset_idempotently() {
        let brasil = dense_target("brasil");
        let foz = dense_target("foz");
        let store = MemoryStore::new(vec![brasil.clone(), foz.clone()]);
        let m = month(2023, 11);
        store.insert_months(&[m]).await.unwrap();
        store.record_artifact(m, "/data/BR_20231101_20231130.nc").await.unwrap();
        consumed(&store, &brasil, m).await;
        consumed(&store, &foz, m).await;
        store.insert_aggregate_rows("brasil", rows_for(m, 280));
        store.insert_aggregate_rows("foz", rows_for(m, 300));

        let reconciler = Reconciler::new(vec![brasil.clone(), foz.clone()], Duration::from_secs(1));
        let report = reconciler.run(&store).await;
        assert!(report.is_clean());
        assert_eq!(
            report.targets[0].purged,
            vec![PurgedMonth { month: m, expected: 300, found: 280, deleted: 280 }]
        );
        assert!(report.targets[1].purged.is_empty());

        assert_eq!(store.aggregate_rows_in("brasil", m), 0);
        assert_eq!(store.aggregate_rows_in("foz", m), 300);
        let row = store.get(m).await.unwrap().unwrap();
        assert_eq!(row.consumer("brasil"), None);
        assert_eq!(row.consumer("foz"), Some(ConsumerStatus::Done));
        assert_eq!(row.path.as_deref(), Some("/data/BR_20231101_20231130.nc"));

        let rerun = reconciler.run(&store).await;
        assert_eq!(rerun.purged_months(), 0);
        assert_eq!(store.aggregate_rows_in("foz", m), 300);
        assert_eq!(store.get(m).await.unwrap().unwrap(), row);
    }

    #[test]
    fn emptied_done_months_count_as_zero() {
        let counts = vec![MonthCount { month: month(2023, 11), rows: 300 }];
        let merged = with_emptied_done_months(counts, &[month(2023, 10), month(2023, 11)]);
        assert_eq!(
            merged,
            vec![
                MonthCount { month: month(2023, 10), rows: 0 },
                MonthCount { month: month(2023, 11), rows: 300 },
            ]
        );
    }

    #[tokio::test]
    async fn done_month_with_no_rows_is_reset() {
        let brasil = dense_target("brasil");
        let store = MemoryStore::new(vec![brasil.clone()]);
        let (emptied, loading) = (month(2023, 11), month(2023, 12));
        store.insert_months(&[emptied, loading]).await.unwrap();
        store.record_artifact(emptied, "/data/BR_20231101_20231130.nc").await.unwrap();
        store.record_artifact(loading, "/data/BR_20231201_20231231.nc").await.unwrap();
        consumed(&store, &brasil, emptied).await;
        assert!(store.begin_consume(&brasil, loading).await.unwrap());

        let reconciler = Reconciler::new(vec![brasil.clone()], Duration::from_secs(1));
        let report = reconciler.run(&store).await;
        assert!(report.is_clean());
        assert_eq!(
            report.targets[0].purged,
            vec![PurgedMonth { month: emptied, expected: 300, found: 0, deleted: 0 }]
        );
        assert_eq!(store.get(emptied).await.unwrap().unwrap().consumer("brasil"), None);
        assert_eq!(
            store.get(loading).await.unwrap().unwrap().consumer("brasil"),
            Some(ConsumerStatus::InProgress)
        );
        assert_eq!(store.next_unconsumed(&brasil).await.unwrap(), Some(emptied));

        let rerun = reconciler.run(&store).await;
        assert_eq!(rerun.purged_months(), 0);
    }

    #[tokio::test]
    async fn store_failure_is_reported_per_target() {
        let store = MemoryStore::new(vec![]);
        store.set_offline(true);
        let reconciler = Reconciler::new(AggregateTarget::builtin(), Duration::from_secs(1));
        let report = reconciler.run(&store).await;
        assert_eq!(report.errors.len(), 2);
        assert!(!report.is_clean());
    }
}
