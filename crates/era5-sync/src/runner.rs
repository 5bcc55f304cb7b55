//! Long-running task runner: cron-triggered acquisition and reconciliation.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use era5_core::Cadence;
use era5_storage::BackoffPolicy;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cadence::{CadenceChange, CadenceController, CadenceCrons};
use crate::calendar::heal_stale_downloads;
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::store::Store;
use crate::task::{AcquisitionTask, TickReport};

#[derive(Debug, Clone)]
pub struct RunnerSchedule {
    pub crons: CadenceCrons,
    pub reconcile_cron: String,
    pub retry: BackoffPolicy,
    pub stale_grace: std::time::Duration,
    pub store_timeout: std::time::Duration,
}

#[derive(Debug, Clone, Copy)]
struct ActiveJob {
    id: Uuid,
    cadence: Cadence,
}

struct RunnerInner {
    scheduler: JobScheduler,
    store: Arc<dyn Store>,
    task: AcquisitionTask,
    reconciler: Reconciler,
    controller: CadenceController,
    schedule: RunnerSchedule,
    acquisition_job: Mutex<Option<ActiveJob>>,
    acquisition_running: Mutex<()>,
    reconcile_running: Mutex<()>,
}

pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    pub async fn new(
        store: Arc<dyn Store>,
        task: AcquisitionTask,
        reconciler: Reconciler,
        controller: CadenceController,
        schedule: RunnerSchedule,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        Ok(Self {
            inner: Arc::new(RunnerInner {
                scheduler,
                store,
                task,
                reconciler,
                controller,
                schedule,
                acquisition_job: Mutex::new(None),
                acquisition_running: Mutex::new(()),
                reconcile_running: Mutex::new(()),
            }),
        })
    }

    /// Heals abandoned claims, registers jobs for the persisted cadence and starts triggering.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        match heal_stale_downloads(
            &*inner.store,
            Utc::now(),
            inner.schedule.stale_grace,
            inner.schedule.store_timeout,
        )
        .await
        {
            Ok(healed) => info!(healed = healed.len(), "startup self-heal finished"),
            Err(err) => warn!(error = %err, "startup self-heal failed; retried before each tick"),
        }

        let cadence = match inner.controller.current(&*inner.store).await {
            Ok(cadence) => cadence,
            Err(err) => {
                warn!(error = %err, "could not load persisted cadence; starting in catch-up");
                Cadence::CatchUp
            }
        };
        let job = RunnerInner::acquisition_job(inner, cadence)?;
        let id = inner.scheduler.add(job).await.context("adding acquisition job")?;
        *inner.acquisition_job.lock().await = Some(ActiveJob { id, cadence });

        let reconcile = RunnerInner::reconcile_job(inner)?;
        inner
            .scheduler
            .add(reconcile)
            .await
            .context("adding reconcile job")?;

        inner.scheduler.start().await.context("starting scheduler")?;
        info!(
            %cadence,
            acquisition_cron = inner.schedule.crons.cron_for(cadence),
            reconcile_cron = %inner.schedule.reconcile_cron,
            "scheduler started"
        );
        Ok(())
    }

    /// Runs until ctrl-c, then stops triggering. An attempt cut short leaves its
    /// claim for the next startup self-heal.
    pub async fn run_until_shutdown(self) -> Result<()> {
        self.start().await?;
        tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
        info!("shutdown requested");
        let mut scheduler = self.inner.scheduler.clone();
        scheduler.shutdown().await.context("stopping scheduler")?;
        Ok(())
    }

    pub async fn current_cadence(&self) -> Option<Cadence> {
        self.inner.acquisition_job.lock().await.map(|job| job.cadence)
    }

    /// One acquisition invocation with the runner's retry policy. `None` when an
    /// earlier invocation is still running.
    pub async fn run_acquisition(&self) -> Option<TickReport> {
        RunnerInner::run_acquisition(&self.inner).await
    }

    pub async fn run_reconcile(&self) -> Option<ReconcileReport> {
        self.inner.run_reconcile().await
    }
}

impl RunnerInner {
    fn acquisition_job(inner: &Arc<Self>, cadence: Cadence) -> Result<Job> {
        let cron = inner.schedule.crons.cron_for(cadence).to_string();
        let inner = Arc::clone(inner);
        Job::new_async(cron.as_str(), move |_uuid, _l| {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                RunnerInner::run_acquisition(&inner).await;
            })
        })
        .with_context(|| format!("creating acquisition job for cron {cron}"))
    }

    fn reconcile_job(inner: &Arc<Self>) -> Result<Job> {
        let cron = inner.schedule.reconcile_cron.clone();
        let inner = Arc::clone(inner);
        Job::new_async(cron.as_str(), move |_uuid, _l| {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                inner.run_reconcile().await;
            })
        })
        .with_context(|| format!("creating reconcile job for cron {cron}"))
    }

    async fn run_acquisition(inner: &Arc<Self>) -> Option<TickReport> {
        let Ok(_running) = inner.acquisition_running.try_lock() else {
            info!("previous acquisition still running; skipping trigger");
            return None;
        };

        let retry = inner.schedule.retry;
        let mut attempt = 0usize;
        let report = loop {
            let report = inner.task.tick(Utc::now()).await;
            let retryable = report.failure_kind().map(|k| k.is_retryable()).unwrap_or(false);
            if !retryable || attempt >= retry.max_retries {
                break report;
            }
            let delay = retry.delay_for_attempt(attempt);
            warn!(
                attempt = attempt + 1,
                max_retries = retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                reason = %report.failure_reason().unwrap_or_default(),
                "retrying acquisition"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        };

        if let Some(reason) = report.failure_reason() {
            error!(run_id = %report.run_id, %reason, "acquisition invocation failed");
        }
        if let Some(desired) = report.desired_cadence {
            RunnerInner::apply_cadence(inner, desired).await;
        }
        Some(report)
    }

    async fn run_reconcile(&self) -> Option<ReconcileReport> {
        let Ok(_running) = self.reconcile_running.try_lock() else {
            info!("previous reconcile still running; skipping trigger");
            return None;
        };
        let report = self.reconciler.run(&*self.store).await;
        if !report.is_clean() {
            error!(errors = ?report.errors, "reconcile invocation failed");
        }
        Some(report)
    }

    /// Persists the degrade, then swaps the trigger. Any failure keeps the current trigger.
    async fn apply_cadence(inner: &Arc<Self>, desired: Cadence) {
        let mut active = inner.acquisition_job.lock().await;
        if active.map(|job| job.cadence) == Some(desired) {
            return;
        }
        if desired != Cadence::SteadyState {
            warn!(%desired, "cadence only degrades to steady state; ignoring");
            return;
        }

        let change = match inner.controller.degrade(&*inner.store).await {
            Ok(change) => change,
            Err(err) => {
                error!(error = %err, "persisting cadence failed; keeping current trigger");
                return;
            }
        };
        let target = change.current();
        if let CadenceChange::Degraded { from, to } = change {
            info!(%from, %to, "acquisition cadence degraded");
        }

        let Some(previous) = *active else {
            return;
        };
        if previous.cadence == target {
            return;
        }

        let replacement = match RunnerInner::acquisition_job(inner, target) {
            Ok(job) => job,
            Err(err) => {
                error!(error = %err, "building replacement job failed; keeping current trigger");
                return;
            }
        };
        let id = match inner.scheduler.add(replacement).await {
            Ok(id) => id,
            Err(err) => {
                error!(error = %err, "registering replacement job failed; keeping current trigger");
                return;
            }
        };
        *active = Some(ActiveJob { id, cadence: target });
        if let Err(err) = inner.scheduler.remove(&previous.id).await {
            warn!(error = %err, job = %previous.id, "removing previous acquisition job failed");
        }
        info!(
            cron = inner.schedule.crons.cron_for(target),
            "acquisition trigger rewritten"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::populate_calendar;
    use crate::coordinator::testing::{Script, ScriptedClient};
    use crate::coordinator::Coordinator;
    use crate::memory::MemoryStore;
    use crate::store::StatusStore;
    use crate::task::TaskTimings;
    use era5_core::Month;
    use std::time::Duration;

    /// Triggers that will not fire while a test runs.
    fn schedule() -> RunnerSchedule {
        RunnerSchedule {
            crons: CadenceCrons {
                catch_up: "0 0 0 1 1 *".to_string(),
                steady_state: "0 0 0 1 7 *".to_string(),
            },
            reconcile_cron: "0 0 0 1 1 *".to_string(),
            retry: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            stale_grace: Duration::from_secs(4 * 3600),
            store_timeout: Duration::from_secs(1),
        }
    }

    async fn runner(store: Arc<MemoryStore>, client: Arc<ScriptedClient>) -> Runner {
        let coordinator = Coordinator::new(client, Duration::from_secs(5), Duration::from_secs(1));
        let task = AcquisitionTask::new(
            store.clone(),
            coordinator,
            TaskTimings {
                store_timeout: Duration::from_secs(1),
                safety_margin: Duration::from_secs(8 * 86_400),
                stale_grace: Duration::from_secs(4 * 3600),
            },
        );
        let reconciler = Reconciler::new(vec![], Duration::from_secs(1));
        let controller = CadenceController::new("test_acquisition", Duration::from_secs(1));
        Runner::new(store, task, reconciler, controller, schedule())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn failed_ticks_are_retried_up_to_the_limit() {
        let store = Arc::new(MemoryStore::new(vec![]));
        let client = Arc::new(ScriptedClient::new(Script::Reject));
        let runner = runner(store.clone(), client.clone()).await;

        let report = runner.run_acquisition().await.unwrap();
        assert!(report.is_failure());
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_backlog_rewrites_the_trigger() {
        let store = Arc::new(MemoryStore::new(vec![]));
        let end = crate::calendar::calendar_end(crate::calendar::effective_date(
            Utc::now(),
            Duration::from_secs(8 * 86_400),
        ));
        populate_calendar(&*store, end, Duration::from_secs(1)).await.unwrap();
        for m in Month::range(era5_core::PROVIDER_FLOOR, end) {
            store.record_artifact(m, "a.nc").await.unwrap();
        }
        let client = Arc::new(ScriptedClient::new(Script::Artifact));
        let runner = runner(store.clone(), client.clone()).await;
        runner.start().await.unwrap();
        assert_eq!(runner.current_cadence().await, Some(Cadence::CatchUp));

        runner.run_acquisition().await.unwrap();
        assert_eq!(runner.current_cadence().await, Some(Cadence::SteadyState));
        assert_eq!(
            store.load_cadence("test_acquisition").await.unwrap(),
            Some(Cadence::SteadyState)
        );
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn overlapping_triggers_are_skipped() {
        let store = Arc::new(MemoryStore::new(vec![]));
        let client = Arc::new(ScriptedClient::new(Script::Slow(Duration::from_millis(100))));
        let runner = Arc::new(runner(store, client.clone()).await);

        let first = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run_acquisition().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(runner.run_acquisition().await.is_none());
        assert!(first.await.unwrap().is_some());
        assert_eq!(client.calls(), 1);
    }
}
