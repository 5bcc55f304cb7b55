//! Acquisition client contract + Copernicus CDS and fixture-directory implementations.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use era5_core::ArtifactRef;
use era5_storage::{ArtifactStore, FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "era5-acquire";

pub const DEFAULT_CDS_URL: &str = "https://cds.climate.copernicus.eu/api/v2";
pub const ERA5_SINGLE_LEVELS: &str = "reanalysis-era5-single-levels";

/// Longest range the provider accepts in one request.
pub const MAX_REQUEST_DAYS: i64 = 367;

const VARIABLES: [&str; 4] = [
    "2m_temperature",
    "total_precipitation",
    "2m_dewpoint_temperature",
    "mean_sea_level_pressure",
];

const SAMPLE_TIMES: [&str; 8] = [
    "00:00", "03:00", "06:00", "09:00", "12:00", "15:00", "18:00", "21:00",
];

/// Brazil bounding box as `[north, west, south, east]`.
pub const BR_AREA: [f64; 4] = [5.5, -74.0, -33.75, -32.25];

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("provider credentials are not configured (set CDSAPI_KEY=<UID>:<API_KEY>)")]
    Credentials,
    #[error("invalid request range: {0}")]
    InvalidRange(String),
    #[error("provider rejected the request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("artifact storage failed: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Downloads one date range from the data provider.
#[async_trait]
pub trait AcquisitionClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` when the provider had nothing for the range.
    async fn fetch(
        &self,
        month_start: NaiveDate,
        month_end: NaiveDate,
    ) -> Result<Option<ArtifactRef>, AcquireError>;
}

/// Body of an ERA5 single-levels retrieval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CdsRequest {
    pub product_type: &'static str,
    pub variable: Vec<&'static str>,
    pub year: Vec<String>,
    pub month: Vec<String>,
    pub day: Vec<String>,
    pub time: Vec<&'static str>,
    pub area: [f64; 4],
    pub format: &'static str,
}

impl CdsRequest {
    pub fn for_range(start: NaiveDate, end: NaiveDate) -> Result<Self, AcquireError> {
        if end < start {
            return Err(AcquireError::InvalidRange(format!("{end} is before {start}")));
        }
        let span = (end - start).num_days();
        if span > MAX_REQUEST_DAYS {
            return Err(AcquireError::InvalidRange(format!(
                "{span} days exceeds the {MAX_REQUEST_DAYS} day limit"
            )));
        }

        let mut years = BTreeSet::new();
        let mut months = BTreeSet::new();
        let mut days = BTreeSet::new();
        for date in start.iter_days().take_while(|d| *d <= end) {
            years.insert(format!("{:04}", date.year()));
            months.insert(format!("{:02}", date.month()));
            days.insert(format!("{:02}", date.day()));
        }

        Ok(Self {
            product_type: "reanalysis",
            variable: VARIABLES.to_vec(),
            year: years.into_iter().collect(),
            month: months.into_iter().collect(),
            day: days.into_iter().collect(),
            time: SAMPLE_TIMES.to_vec(),
            area: BR_AREA,
            format: "netcdf",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CdsState {
    Queued,
    Running,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CdsReply {
    pub state: CdsState,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub content_length: Option<u64>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CdsProgress {
    Pending(String),
    Ready(String),
    Empty,
    Failed(String),
}

impl CdsReply {
    pub fn progress(&self) -> CdsProgress {
        match self.state {
            CdsState::Completed => match (&self.location, self.content_length) {
                (_, Some(0)) | (None, _) => CdsProgress::Empty,
                (Some(location), _) => CdsProgress::Ready(location.clone()),
            },
            CdsState::Failed => CdsProgress::Failed(
                self.error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "task failed without detail".to_string()),
            ),
            CdsState::Queued | CdsState::Running | CdsState::Unknown => match &self.request_id {
                Some(id) => CdsProgress::Pending(id.clone()),
                None => CdsProgress::Failed(format!("{:?} reply without a request id", self.state)),
            },
        }
    }
}

/// Client for the Copernicus Climate Data Store retrieval API.
#[derive(Debug)]
pub struct CdsClient {
    http: HttpFetcher,
    artifacts: ArtifactStore,
    base_url: String,
    dataset: String,
    poll_interval: Duration,
}

impl CdsClient {
    pub fn new(http: HttpFetcher, artifacts: ArtifactStore, base_url: impl Into<String>) -> Self {
        Self {
            http,
            artifacts,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            dataset: ERA5_SINGLE_LEVELS.to_string(),
            poll_interval: Duration::from_secs(30),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn retrieve(&self, request: &CdsRequest) -> Result<Option<Vec<u8>>, AcquireError> {
        let submit_url = format!("{}/resources/{}", self.base_url, self.dataset);
        let mut reply: CdsReply = self.http.post_json(&submit_url, request).await?;

        loop {
            match reply.progress() {
                CdsProgress::Ready(location) => {
                    let body = self.http.fetch_bytes(&location).await?.body;
                    return Ok((!body.is_empty()).then_some(body));
                }
                CdsProgress::Empty => return Ok(None),
                CdsProgress::Failed(reason) => return Err(AcquireError::Rejected(reason)),
                CdsProgress::Pending(request_id) => {
                    debug!(%request_id, state = ?reply.state, "cds request pending");
                    tokio::time::sleep(self.poll_interval).await;
                    let task_url = format!("{}/tasks/{}", self.base_url, request_id);
                    reply = self.http.get_json(&task_url).await?;
                }
            }
        }
    }
}

#[async_trait]
impl AcquisitionClient for CdsClient {
    fn name(&self) -> &'static str {
        "cds"
    }

    async fn fetch(
        &self,
        month_start: NaiveDate,
        month_end: NaiveDate,
    ) -> Result<Option<ArtifactRef>, AcquireError> {
        let request = CdsRequest::for_range(month_start, month_end)?;

        if let Some(existing) = self.artifacts.existing(month_start, month_end, "nc").await? {
            info!(path = %existing.absolute_path.display(), "artifact already downloaded");
            return Ok(Some(existing.absolute_path.display().to_string()));
        }

        if !self.http.has_credentials() {
            return Err(AcquireError::Credentials);
        }

        let Some(bytes) = self.retrieve(&request).await? else {
            warn!(%month_start, %month_end, "provider returned no data");
            return Ok(None);
        };

        let stored = self
            .artifacts
            .store_bytes(month_start, month_end, "nc", &bytes)
            .await?;
        info!(
            path = %stored.absolute_path.display(),
            bytes = stored.byte_size,
            "netcdf downloaded"
        );
        Ok(Some(stored.absolute_path.display().to_string()))
    }
}

/// Resolves ranges against files already present in an artifact directory.
#[derive(Debug, Clone)]
pub struct FixtureClient {
    artifacts: ArtifactStore,
}

impl FixtureClient {
    pub fn new(artifacts: ArtifactStore) -> Self {
        Self { artifacts }
    }
}

#[async_trait]
impl AcquisitionClient for FixtureClient {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn fetch(
        &self,
        month_start: NaiveDate,
        month_end: NaiveDate,
    ) -> Result<Option<ArtifactRef>, AcquireError> {
        let existing = self.artifacts.existing(month_start, month_end, "nc").await?;
        Ok(existing.map(|a| a.absolute_path.display().to_string()))
    }
}
