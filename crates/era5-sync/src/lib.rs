//! Acquisition scheduler and consistency reconciler for monthly ERA5 extracts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use era5_acquire::{AcquisitionClient, CdsClient, FixtureClient};
use era5_core::{AggregateTarget, Month};
use era5_storage::{ArtifactStore, BasicCredentials, HttpClientConfig, HttpFetcher};
use tracing::{error, info};

pub mod cadence;
pub mod calendar;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod reconciler;
pub mod report;
pub mod runner;
pub mod selector;
pub mod store;
pub mod task;

pub use cadence::{CadenceChange, CadenceController, CadenceCrons, ACQUISITION_TASK};
pub use calendar::{calendar_end, effective_date, heal_stale_downloads, populate_calendar};
pub use config::{load_targets, SyncConfig, MEMORY_DATABASE_URL};
pub use coordinator::{AttemptOutcome, Coordinator};
pub use error::{FailureKind, ScheduleError, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use reconciler::{ReconcileReport, Reconciler};
pub use report::{write_status_report, StatusReport, StatusSummary};
pub use runner::{Runner, RunnerSchedule};
pub use selector::{select_next_month, Selection};
pub use store::{AggregateStore, StatusStore, Store};
pub use task::{AcquisitionTask, TaskTimings, TickOutcome, TickReport};

pub const CRATE_NAME: &str = "era5-sync";

/// Picks the fixture client when `ERA5_FIXTURES_DIR` is set, otherwise the CDS client.
pub fn acquisition_client(config: &SyncConfig) -> Result<Arc<dyn AcquisitionClient>> {
    if let Some(dir) = &config.fixtures_dir {
        info!(dir = %dir.display(), "using fixture acquisition client");
        return Ok(Arc::new(FixtureClient::new(ArtifactStore::new(dir.clone()))));
    }

    let credentials = match &config.cds_key {
        Some(key) => match BasicCredentials::parse(key) {
            Some(credentials) => Some(credentials),
            None => bail!("CDSAPI_KEY must look like <UID>:<API_KEY>"),
        },
        None => None,
    };
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        credentials,
        ..Default::default()
    })?;
    let client = CdsClient::new(http, ArtifactStore::new(config.artifacts_dir.clone()), config.cds_url.clone())
        .with_poll_interval(Duration::from_secs(config.poll_interval_secs));
    Ok(Arc::new(client))
}

/// Every component, wired from one configuration.
pub struct Services {
    pub config: SyncConfig,
    pub targets: Vec<AggregateTarget>,
    pub store: Arc<dyn Store>,
    postgres: Option<PgStore>,
    client: Arc<dyn AcquisitionClient>,
}

impl Services {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let targets = load_targets(&config.targets_path()).await?;
        let client = acquisition_client(&config)?;

        if config.uses_memory_store() {
            info!("using in-process status store; state is not persisted");
            let store = Arc::new(MemoryStore::new(targets.clone()));
            return Ok(Self::with_parts(config, targets, store, client));
        }

        let pg = PgStore::connect(
            &config.database_url,
            config.db_max_connections,
            config.store_timeout(),
            &targets,
        )
        .await
        .context("connecting to status store")?;
        let mut services = Self::with_parts(config, targets, Arc::new(pg.clone()), client);
        services.postgres = Some(pg);
        Ok(services)
    }

    pub fn with_parts(
        config: SyncConfig,
        targets: Vec<AggregateTarget>,
        store: Arc<dyn Store>,
        client: Arc<dyn AcquisitionClient>,
    ) -> Self {
        Self {
            config,
            targets,
            store,
            postgres: None,
            client,
        }
    }

    /// Applies schema migrations. A no-op for the in-process store.
    pub async fn migrate(&self) -> Result<()> {
        if let Some(pg) = &self.postgres {
            pg.migrate().await.context("migrating status store")?;
        }
        Ok(())
    }

    /// Migrates, then creates every month row up to the current calendar end.
    pub async fn init(&self, now: DateTime<Utc>) -> Result<u64> {
        self.migrate().await?;
        let end = calendar_end(effective_date(now, self.config.safety_margin()));
        let created = populate_calendar(&*self.store, end, self.config.store_timeout())
            .await
            .context("populating month calendar")?;
        info!(created, %end, "status store initialized");
        Ok(created)
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(
            Arc::clone(&self.client),
            self.config.fetch_timeout(),
            self.config.store_timeout(),
        )
    }

    pub fn acquisition_task(&self) -> AcquisitionTask {
        AcquisitionTask::new(
            Arc::clone(&self.store),
            self.coordinator(),
            TaskTimings {
                store_timeout: self.config.store_timeout(),
                safety_margin: self.config.safety_margin(),
                stale_grace: self.config.stale_grace(),
            },
        )
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.targets.clone(), self.config.store_timeout())
    }

    pub fn cadence_controller(&self) -> CadenceController {
        CadenceController::new(ACQUISITION_TASK, self.config.store_timeout())
    }

    /// One acquisition tick outside the runner. A requested degrade is persisted so
    /// the next `run` starts on the steady trigger.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let report = self.acquisition_task().tick(now).await;
        if report.desired_cadence.is_some() {
            if let Err(err) = self.cadence_controller().degrade(&*self.store).await {
                error!(error = %err, "persisting cadence failed; keeping current cadence");
            }
        }
        report
    }

    pub async fn heal(&self, now: DateTime<Utc>) -> Result<Vec<Month>> {
        heal_stale_downloads(
            &*self.store,
            now,
            self.config.stale_grace(),
            self.config.store_timeout(),
        )
        .await
        .context("healing stale downloads")
    }

    pub async fn reconcile(&self) -> ReconcileReport {
        self.reconciler().run(&*self.store).await
    }

    pub async fn status_report(&self) -> Result<StatusReport> {
        write_status_report(&*self.store, &self.targets, &self.config.workspace_root).await
    }

    pub async fn runner(&self) -> Result<Runner> {
        Runner::new(
            Arc::clone(&self.store),
            self.acquisition_task(),
            self.reconciler(),
            self.cadence_controller(),
            RunnerSchedule {
                crons: self.config.crons(),
                reconcile_cron: self.config.reconcile_cron.clone(),
                retry: self.config.retry_policy(),
                stale_grace: self.config.stale_grace(),
                store_timeout: self.config.store_timeout(),
            },
        )
        .await
    }
}
