use std::time::Duration;

use era5_core::Month;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{op} timed out after {limit:?}")]
    Timeout { op: &'static str, limit: Duration },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid SQL identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("no status row for {0}")]
    MissingMonth(Month),
    #[error("corrupt status row: {0}")]
    Corrupt(String),
}

/// Why an acquisition attempt failed. Surfaced as the `kind` of a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Store,
    Timeout,
    Empty,
    Client,
    Aborted,
    BoundExceeded,
}

impl FailureKind {
    /// Whether a later attempt can succeed without operator action.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::BoundExceeded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Timeout => "timeout",
            Self::Empty => "empty",
            Self::Client => "client",
            Self::Aborted => "aborted",
            Self::BoundExceeded => "bound_exceeded",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("status store is empty; the month calendar must be populated first")]
    Uninitialized,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("acquisition of {month} failed ({kind}): {reason}")]
    Acquisition {
        month: Month,
        kind: FailureKind,
        reason: String,
    },
}

impl ScheduleError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Uninitialized | Self::Store(_) => FailureKind::Store,
            Self::Acquisition { kind, .. } => *kind,
        }
    }
}
