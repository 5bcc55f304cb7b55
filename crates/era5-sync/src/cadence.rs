use std::time::Duration;

use era5_core::Cadence;
use serde::Serialize;
use tracing::info;

use crate::error::StoreError;
use crate::store::{bounded, StatusStore};

/// Key of the acquisition task in the cadence table.
pub const ACQUISITION_TASK: &str = "era5_acquisition";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum CadenceChange {
    Unchanged { cadence: Cadence },
    Degraded { from: Cadence, to: Cadence },
}

impl CadenceChange {
    pub fn current(self) -> Cadence {
        match self {
            Self::Unchanged { cadence } => cadence,
            Self::Degraded { to, .. } => to,
        }
    }
}

/// Cron expressions (with a seconds field) for each cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CadenceCrons {
    pub catch_up: String,
    pub steady_state: String,
}

impl CadenceCrons {
    pub fn cron_for(&self, cadence: Cadence) -> &str {
        match cadence {
            Cadence::CatchUp => &self.catch_up,
            Cadence::SteadyState => &self.steady_state,
        }
    }
}

/// Persists the trigger cadence of one task. Only ever moves from catch-up to steady state.
#[derive(Debug, Clone)]
pub struct CadenceController {
    task: String,
    store_timeout: Duration,
}

impl CadenceController {
    pub fn new(task: impl Into<String>, store_timeout: Duration) -> Self {
        Self {
            task: task.into(),
            store_timeout,
        }
    }

    /// Tasks start in catch-up until a degrade has been persisted.
    pub async fn current<S>(&self, store: &S) -> Result<Cadence, StoreError>
    where
        S: StatusStore + ?Sized,
    {
        let stored = bounded(self.store_timeout, "load_cadence", store.load_cadence(&self.task)).await?;
        Ok(stored.unwrap_or(Cadence::CatchUp))
    }

    /// On error nothing was persisted and the caller must keep its current trigger.
    pub async fn degrade<S>(&self, store: &S) -> Result<CadenceChange, StoreError>
    where
        S: StatusStore + ?Sized,
    {
        let from = self.current(store).await?;
        if from == Cadence::SteadyState {
            return Ok(CadenceChange::Unchanged { cadence: from });
        }
        bounded(
            self.store_timeout,
            "save_cadence",
            store.save_cadence(&self.task, Cadence::SteadyState),
        )
        .await?;
        info!(task = %self.task, %from, to = %Cadence::SteadyState, "cadence degraded");
        Ok(CadenceChange::Degraded {
            from,
            to: Cadence::SteadyState,
        })
    }
}
