//! One acquisition attempt for one month.
//!
//! Phases commit to the status store independently:
//! 1. claim the month (conditional write, at most one winner),
//! 2. run the acquisition client under `fetch_timeout`,
//! 3. record the artifact path,
//! 4. release the claim.
//!
//! Phase 4 runs on every path out of phase 2, including client errors, empty
//! results, timeouts and panics. A process crash between phases leaves the claim
//! behind for [`crate::calendar::heal_stale_downloads`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use era5_acquire::AcquisitionClient;
use era5_core::{ArtifactRef, Month};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{FailureKind, ScheduleError, StoreError};
use crate::store::{bounded, StatusStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Acquired { month: Month, artifact: ArtifactRef },
    /// Another invocation holds the month, or it was acquired meanwhile.
    NotClaimed { month: Month },
}

#[derive(Clone)]
pub struct Coordinator {
    client: Arc<dyn AcquisitionClient>,
    fetch_timeout: Duration,
    store_timeout: Duration,
}

/// Aborts the fetch task if the attempt itself is dropped mid-flight.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Coordinator {
    pub fn new(client: Arc<dyn AcquisitionClient>, fetch_timeout: Duration, store_timeout: Duration) -> Self {
        Self {
            client,
            fetch_timeout,
            store_timeout,
        }
    }

    pub fn client_name(&self) -> &'static str {
        self.client.name()
    }

    pub async fn acquire<S>(&self, store: &S, month: Month, now: DateTime<Utc>) -> Result<AttemptOutcome, ScheduleError>
    where
        S: StatusStore + ?Sized,
    {
        let claimed = bounded(self.store_timeout, "try_claim", store.try_claim(month, now)).await?;
        if !claimed {
            info!(%month, "month already claimed or acquired; skipping");
            return Ok(AttemptOutcome::NotClaimed { month });
        }

        let result = match self.fetch(month).await {
            Ok(artifact) => self.record(store, month, artifact).await,
            Err(err) => Err(err),
        };

        if let Err(release_err) = bounded(self.store_timeout, "release", store.release(month)).await {
            match &result {
                Ok(_) => warn!(%month, error = %release_err, "release after success failed; claim already cleared"),
                Err(_) => error!(%month, error = %release_err, "release failed; month stays claimed until healed"),
            }
        }

        match &result {
            Ok(AttemptOutcome::Acquired { artifact, .. }) => info!(%month, %artifact, "month acquired"),
            Ok(AttemptOutcome::NotClaimed { .. }) => {}
            Err(err) => warn!(%month, kind = %err.kind(), error = %err, "acquisition attempt failed"),
        }
        result
    }

    async fn fetch(&self, month: Month) -> Result<ArtifactRef, ScheduleError> {
        let client = Arc::clone(&self.client);
        let (start, end) = (month.first_day(), month.last_day());
        let mut task = AbortOnDrop(tokio::spawn(async move { client.fetch(start, end).await }));

        let failure = |kind: FailureKind, reason: String| ScheduleError::Acquisition { month, kind, reason };
        match tokio::time::timeout(self.fetch_timeout, &mut task.0).await {
            Ok(Ok(Ok(Some(artifact)))) => Ok(artifact),
            Ok(Ok(Ok(None))) => Err(failure(
                FailureKind::Empty,
                format!("{} returned no artifact for {start}..{end}", self.client.name()),
            )),
            Ok(Ok(Err(err))) => Err(failure(FailureKind::Client, err.to_string())),
            Ok(Err(join_err)) => Err(failure(FailureKind::Aborted, join_err.to_string())),
            Err(_) => {
                task.0.abort();
                Err(failure(
                    FailureKind::Timeout,
                    format!("fetch exceeded {:?}", self.fetch_timeout),
                ))
            }
        }
    }

    async fn record<S>(&self, store: &S, month: Month, artifact: ArtifactRef) -> Result<AttemptOutcome, ScheduleError>
    where
        S: StatusStore + ?Sized,
    {
        bounded::<_, StoreError, _>(
            self.store_timeout,
            "record_artifact",
            store.record_artifact(month, &artifact),
        )
        .await?;
        Ok(AttemptOutcome::Acquired { month, artifact })
    }
}
