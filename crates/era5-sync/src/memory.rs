//! In-process store backend. Every operation takes one lock, so compare-and-set
//! semantics match the single-statement updates of the Postgres backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use era5_core::{AggregateTarget, Cadence, ConsumerStatus, Month, MonthStatus};

use crate::error::StoreError;
use crate::store::{AggregateStore, MonthCount, StatusStore};

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<Month, MonthStatus>,
    aggregates: HashMap<String, Vec<NaiveDate>>,
    cadences: HashMap<String, Cadence>,
    offline: bool,
}

#[derive(Debug)]
pub struct MemoryStore {
    targets: Vec<AggregateTarget>,
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new(targets: Vec<AggregateTarget>) -> Self {
        Self {
            targets,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Simulates the store becoming unreachable.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.offline = offline;
        }
    }

    /// Appends aggregate rows, one per timestamp, to the target's table.
    pub fn insert_aggregate_rows(&self, target: &str, dates: impl IntoIterator<Item = NaiveDate>) {
        if let Ok(mut state) = self.state.lock() {
            state
                .aggregates
                .entry(target.to_string())
                .or_default()
                .extend(dates);
        }
    }

    pub fn aggregate_rows_in(&self, target: &str, month: Month) -> usize {
        self.state
            .lock()
            .map(|state| {
                state
                    .aggregates
                    .get(target)
                    .map(|rows| rows.iter().filter(|d| Month::containing(**d) == month).count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Direct row access for seeding states that only an interrupted process leaves behind.
    pub fn update_row(&self, month: Month, f: impl FnOnce(&mut MonthStatus)) -> bool {
        match self.state.lock() {
            Ok(mut state) => match state.rows.get_mut(&month) {
                Some(row) => {
                    f(row);
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        let state = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        if state.offline {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(state)
    }

    fn new_row(&self, month: Month) -> MonthStatus {
        let mut row = MonthStatus::new(month);
        for target in &self.targets {
            row.consumers.insert(target.name.clone(), None);
        }
        row
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn month_count(&self) -> Result<i64, StoreError> {
        Ok(self.state()?.rows.len() as i64)
    }

    async fn insert_months(&self, months: &[Month]) -> Result<u64, StoreError> {
        let mut state = self.state()?;
        let mut created = 0;
        for month in months {
            if !state.rows.contains_key(month) {
                state.rows.insert(*month, self.new_row(*month));
                created += 1;
            }
        }
        Ok(created)
    }

    async fn latest_acquired(&self) -> Result<Option<Month>, StoreError> {
        let state = self.state()?;
        Ok(state
            .rows
            .values()
            .rev()
            .find(|row| row.path.is_some())
            .map(|row| row.month))
    }

    async fn latest_pending(&self) -> Result<Option<Month>, StoreError> {
        let state = self.state()?;
        Ok(state
            .rows
            .values()
            .rev()
            .find(|row| row.path.is_none() && !row.downloading)
            .map(|row| row.month))
    }

    async fn try_claim(&self, month: Month, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        match state.rows.get_mut(&month) {
            Some(row) if !row.downloading && row.path.is_none() => {
                row.downloading = true;
                row.downloading_since = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_artifact(&self, month: Month, path: &str) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let row = state
            .rows
            .get_mut(&month)
            .ok_or(StoreError::MissingMonth(month))?;
        row.path = Some(path.to_string());
        row.downloading = false;
        row.downloading_since = None;
        Ok(())
    }

    async fn release(&self, month: Month) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if let Some(row) = state.rows.get_mut(&month) {
            row.downloading = false;
            row.downloading_since = None;
        }
        Ok(())
    }

    async fn release_stale(&self, claimed_before: DateTime<Utc>) -> Result<Vec<Month>, StoreError> {
        let mut state = self.state()?;
        let mut released = Vec::new();
        for row in state.rows.values_mut() {
            let stale = row
                .downloading_since
                .map(|since| since < claimed_before)
                .unwrap_or(true);
            if row.downloading && stale {
                row.downloading = false;
                row.downloading_since = None;
                released.push(row.month);
            }
        }
        Ok(released)
    }

    async fn get(&self, month: Month) -> Result<Option<MonthStatus>, StoreError> {
        Ok(self.state()?.rows.get(&month).cloned())
    }

    async fn list(&self) -> Result<Vec<MonthStatus>, StoreError> {
        Ok(self.state()?.rows.values().cloned().collect())
    }

    async fn begin_consume(&self, target: &AggregateTarget, month: Month) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        match state.rows.get_mut(&month) {
            Some(row)
                if row.path.is_some()
                    && ConsumerStatus::can_transition(row.consumer(&target.name), Some(ConsumerStatus::InProgress)) =>
            {
                row.consumers
                    .insert(target.name.clone(), Some(ConsumerStatus::InProgress));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_consume(&self, target: &AggregateTarget, month: Month) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        match state.rows.get_mut(&month) {
            Some(row) if ConsumerStatus::can_transition(row.consumer(&target.name), Some(ConsumerStatus::Done)) => {
                row.consumers
                    .insert(target.name.clone(), Some(ConsumerStatus::Done));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn next_unconsumed(&self, target: &AggregateTarget) -> Result<Option<Month>, StoreError> {
        let state = self.state()?;
        Ok(state
            .rows
            .values()
            .rev()
            .find(|row| row.path.is_some() && row.consumer(&target.name).is_none())
            .map(|row| row.month))
    }

    async fn load_cadence(&self, task: &str) -> Result<Option<Cadence>, StoreError> {
        Ok(self.state()?.cadences.get(task).copied())
    }

    async fn save_cadence(&self, task: &str, cadence: Cadence) -> Result<(), StoreError> {
        self.state()?.cadences.insert(task.to_string(), cadence);
        Ok(())
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn monthly_counts(&self, target: &AggregateTarget) -> Result<Vec<MonthCount>, StoreError> {
        let state = self.state()?;
        let mut counts: BTreeMap<Month, i64> = BTreeMap::new();
        for date in state.aggregates.get(&target.name).into_iter().flatten() {
            *counts.entry(Month::containing(*date)).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(month, rows)| MonthCount { month, rows })
            .collect())
    }

    async fn done_months(&self, target: &AggregateTarget) -> Result<Vec<Month>, StoreError> {
        let state = self.state()?;
        Ok(state
            .rows
            .values()
            .filter(|row| row.consumer(&target.name) == Some(ConsumerStatus::Done))
            .map(|row| row.month)
            .collect())
    }

    async fn purge_month(&self, target: &AggregateTarget, month: Month) -> Result<u64, StoreError> {
        let mut state = self.state()?;
        let mut deleted = 0u64;
        if let Some(rows) = state.aggregates.get_mut(&target.name) {
            let before = rows.len();
            rows.retain(|d| *d < month.first_day() || *d > month.last_day());
            deleted = (before - rows.len()) as u64;
        }
        if let Some(row) = state.rows.get_mut(&month) {
            row.consumers.insert(target.name.clone(), None);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn month(y: i32, m: u32) -> Month {
        Month::from_ymd(y, m).unwrap()
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_released() {
        let store = MemoryStore::new(AggregateTarget::builtin());
        store.insert_months(&[month(2024, 1)]).await.unwrap();

        assert!(store.try_claim(month(2024, 1), Utc::now()).await.unwrap());
        assert!(!store.try_claim(month(2024, 1), Utc::now()).await.unwrap());
        store.release(month(2024, 1)).await.unwrap();
        assert!(store.try_claim(month(2024, 1), Utc::now()).await.unwrap());
        assert!(!store.try_claim(month(2023, 1), Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn recorded_artifacts_cannot_be_claimed_again() {
        let store = MemoryStore::new(vec![]);
        store.insert_months(&[month(2024, 1)]).await.unwrap();
        assert!(store.try_claim(month(2024, 1), Utc::now()).await.unwrap());
        store.record_artifact(month(2024, 1), "/data/a.nc").await.unwrap();

        let row = store.get(month(2024, 1)).await.unwrap().unwrap();
        assert_eq!(row.path.as_deref(), Some("/data/a.nc"));
        assert!(!row.downloading);
        assert!(!store.try_claim(month(2024, 1), Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn consumer_transitions_require_an_artifact_and_in_progress() {
        let targets = AggregateTarget::builtin();
        let store = MemoryStore::new(targets.clone());
        store.insert_months(&[month(2024, 1)]).await.unwrap();

        assert!(!store.begin_consume(&targets[0], month(2024, 1)).await.unwrap());
        assert!(!store.finish_consume(&targets[0], month(2024, 1)).await.unwrap());

        store.record_artifact(month(2024, 1), "/data/a.nc").await.unwrap();
        assert_eq!(store.next_unconsumed(&targets[0]).await.unwrap(), Some(month(2024, 1)));
        assert!(store.begin_consume(&targets[0], month(2024, 1)).await.unwrap());
        assert!(!store.begin_consume(&targets[0], month(2024, 1)).await.unwrap());
        assert!(store.finish_consume(&targets[0], month(2024, 1)).await.unwrap());
        assert_eq!(store.next_unconsumed(&targets[0]).await.unwrap(), None);
        assert!(!store.begin_consume(&targets[0], month(2024, 1)).await.unwrap());
        assert!(!store.finish_consume(&targets[0], month(2024, 1)).await.unwrap());
        assert_eq!(store.next_unconsumed(&targets[1]).await.unwrap(), Some(month(2024, 1)));
    }

    #[tokio::test]
    async fn offline_store_fails_closed() {
        let store = MemoryStore::new(vec![]);
        store.insert_months(&[month(2024, 1)]).await.unwrap();
        store.set_offline(true);
        assert!(matches!(
            store.try_claim(month(2024, 1), Utc::now()).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_offline(false);
        assert!(!store.get(month(2024, 1)).await.unwrap().unwrap().downloading);
    }
}
