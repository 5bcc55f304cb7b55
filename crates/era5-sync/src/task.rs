//! One invocation of the acquisition task: heal, select, acquire.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use era5_core::{ArtifactRef, Cadence, Month};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::calendar::{calendar_end, effective_date, heal_stale_downloads, populate_calendar};
use crate::coordinator::{AttemptOutcome, Coordinator};
use crate::error::{FailureKind, ScheduleError};
use crate::selector::{select_next_month, Selection};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickOutcome {
    Acquired { month: Month, artifact: ArtifactRef },
    NotClaimed { month: Month },
    /// Backlog exhausted.
    Idle,
    Failed { kind: FailureKind, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub effective_date: NaiveDate,
    pub healed: Vec<Month>,
    pub calendar_created: u64,
    pub selection: Option<Selection>,
    pub outcome: TickOutcome,
    /// Set when the task runner should switch triggers.
    pub desired_cadence: Option<Cadence>,
}

impl TickReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, TickOutcome::Failed { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            TickOutcome::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// `kind: reason` for failed ticks.
    pub fn failure_reason(&self) -> Option<String> {
        match &self.outcome {
            TickOutcome::Failed { kind, reason } => Some(format!("{kind}: {reason}")),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TaskTimings {
    pub store_timeout: Duration,
    pub safety_margin: Duration,
    pub stale_grace: Duration,
}

#[derive(Clone)]
pub struct AcquisitionTask {
    store: Arc<dyn Store>,
    coordinator: Coordinator,
    timings: TaskTimings,
}

impl AcquisitionTask {
    pub fn new(store: Arc<dyn Store>, coordinator: Coordinator, timings: TaskTimings) -> Self {
        Self {
            store,
            coordinator,
            timings,
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("acquisition_tick", %run_id, client = self.coordinator.client_name());
        self.tick_inner(run_id, now).instrument(span).await
    }

    async fn tick_inner(&self, run_id: Uuid, now: DateTime<Utc>) -> TickReport {
        let effective = effective_date(now, self.timings.safety_margin);
        let mut report = TickReport {
            run_id,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            effective_date: effective,
            healed: Vec::new(),
            calendar_created: 0,
            selection: None,
            outcome: TickOutcome::Idle,
            desired_cadence: None,
        };

        if let Err(err) = self.step(&mut report, now).await {
            report.outcome = TickOutcome::Failed {
                kind: err.kind(),
                reason: err.to_string(),
            };
        }
        report.finished_at = Utc::now();

        match &report.outcome {
            TickOutcome::Failed { kind, reason } => warn!(%kind, %reason, "acquisition tick failed"),
            outcome => info!(?outcome, selection = ?report.selection, "acquisition tick finished"),
        }
        report
    }

    async fn step(&self, report: &mut TickReport, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        let store = &*self.store;
        let limit = self.timings.store_timeout;

        report.healed = heal_stale_downloads(store, now, self.timings.stale_grace, limit).await?;

        let end = calendar_end(report.effective_date);
        let selection = match select_next_month(store, report.effective_date).await {
            Err(ScheduleError::Uninitialized) => {
                info!(%end, "status store is empty; populating month calendar");
                report.calendar_created += populate_calendar(store, end, limit).await?;
                select_next_month(store, report.effective_date).await?
            }
            other => other?,
        };
        report.selection = Some(selection);

        match selection {
            Selection::CatchUp(target) => {
                report.calendar_created += populate_calendar(store, end, limit).await?;
                self.attempt(report, target, now).await
            }
            Selection::Backlog(month) => self.attempt(report, month, now).await,
            Selection::Exhausted => {
                report.desired_cadence = Some(Cadence::SteadyState);
                report.outcome = TickOutcome::Idle;
                Ok(())
            }
            Selection::BoundExceeded(candidate) => {
                report.desired_cadence = Some(Cadence::SteadyState);
                report.outcome = TickOutcome::Failed {
                    kind: FailureKind::BoundExceeded,
                    reason: format!("backlog candidate {candidate} predates the provider floor"),
                };
                Ok(())
            }
        }
    }

    async fn attempt(&self, report: &mut TickReport, month: Month, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        report.outcome = match self.coordinator.acquire(&*self.store, month, now).await? {
            AttemptOutcome::Acquired { month, artifact } => TickOutcome::Acquired { month, artifact },
            AttemptOutcome::NotClaimed { month } => TickOutcome::NotClaimed { month },
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::testing::{Script, ScriptedClient};
    use crate::memory::MemoryStore;
    use crate::store::StatusStore;
    use chrono::TimeZone;

    fn month(y: i32, m: u32) -> Month {
        Month::from_ymd(y, m).unwrap()
    }

    fn timings() -> TaskTimings {
        TaskTimings {
            store_timeout: Duration::from_secs(1),
            safety_margin: Duration::from_secs(8 * 86_400),
            stale_grace: Duration::from_secs(4 * 3600),
        }
    }

    fn task(store: Arc<MemoryStore>, script: Script) -> AcquisitionTask {
        let client = Arc::new(ScriptedClient::new(script));
        let coordinator = Coordinator::new(client, Duration::from_secs(5), Duration::from_secs(1));
        AcquisitionTask::new(store, coordinator, timings())
    }

    #[tokio::test]
    async fn first_tick_populates_then_catches_up() {
        let store = Arc::new(MemoryStore::new(vec![]));
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 9, 0, 0).unwrap();
        let report = task(store.clone(), Script::Artifact).tick(now).await;

        assert_eq!(report.calendar_created, 290);
        assert_eq!(report.selection, Some(Selection::CatchUp(month(2024, 2))));
        assert!(matches!(report.outcome, TickOutcome::Acquired { month: m, .. } if m == month(2024, 2)));
        assert_eq!(report.desired_cadence, None);
        assert_eq!(store.month_count().await.unwrap(), 290);
    }

    #[tokio::test]
    async fn bound_exceeded_degrades_and_fails() {
        let store = Arc::new(MemoryStore::new(vec![]));
        store.insert_months(&[month(1999, 12), month(2024, 2)]).await.unwrap();
        store.record_artifact(month(2024, 2), "a.nc").await.unwrap();
        populate_calendar(&*store, month(2024, 2), Duration::from_secs(1)).await.unwrap();
        for m in Month::range(month(2000, 1), month(2024, 2)) {
            store.record_artifact(m, "a.nc").await.unwrap();
        }

        let now = Utc.with_ymd_and_hms(2024, 3, 15, 9, 0, 0).unwrap();
        let report = task(store, Script::Artifact).tick(now).await;
        assert_eq!(report.selection, Some(Selection::BoundExceeded(month(1999, 12))));
        assert_eq!(report.failure_kind(), Some(FailureKind::BoundExceeded));
        assert_eq!(report.desired_cadence, Some(Cadence::SteadyState));
    }

    #[tokio::test]
    async fn failed_fetch_is_reported_with_reason() {
        let store = Arc::new(MemoryStore::new(vec![]));
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 9, 0, 0).unwrap();
        let report = task(store.clone(), Script::Reject).tick(now).await;

        assert!(report.is_failure());
        let reason = report.failure_reason().unwrap();
        assert!(reason.starts_with("client: "), "{reason}");
        assert!(reason.contains("quota exceeded"), "{reason}");
        assert!(!store.get(month(2024, 2)).await.unwrap().unwrap().downloading);
    }

    #[tokio::test]
    async fn tick_heals_abandoned_claims_first() {
        let store = Arc::new(MemoryStore::new(vec![]));
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 9, 0, 0).unwrap();
        populate_calendar(&*store, month(2024, 2), Duration::from_secs(1)).await.unwrap();
        store
            .try_claim(month(2024, 2), now - chrono::Duration::days(1))
            .await
            .unwrap();

        let report = task(store, Script::Artifact).tick(now).await;
        assert_eq!(report.healed, vec![month(2024, 2)]);
        assert!(matches!(report.outcome, TickOutcome::Acquired { .. }));
    }
}
