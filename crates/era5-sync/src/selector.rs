//! Picks the single next month to acquire.

use chrono::NaiveDate;
use era5_core::{Month, PROVIDER_FLOOR};
use serde::Serialize;

use crate::error::ScheduleError;
use crate::store::StatusStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", content = "month", rename_all = "snake_case")]
pub enum Selection {
    /// The most recent completed month is missing.
    CatchUp(Month),
    /// Most recent gap that is neither acquired nor in flight.
    Backlog(Month),
    /// Nothing left to acquire.
    Exhausted,
    /// The only candidate predates the provider floor.
    BoundExceeded(Month),
}

impl Selection {
    pub fn month(&self) -> Option<Month> {
        match self {
            Self::CatchUp(m) | Self::Backlog(m) => Some(*m),
            Self::Exhausted | Self::BoundExceeded(_) => None,
        }
    }

    /// True when the acquisition task should drop to its steady cadence.
    pub fn wants_steady_cadence(&self) -> bool {
        matches!(self, Self::Exhausted | Self::BoundExceeded(_))
    }
}

/// The month before the one containing `today`.
pub fn catch_up_target(today: NaiveDate) -> Month {
    Month::containing(today).pred()
}

/// Rule evaluation over already-queried store facts.
pub fn decide(target: Month, latest_acquired: Option<Month>, latest_pending: Option<Month>) -> Selection {
    if target >= PROVIDER_FLOOR && latest_acquired.map_or(true, |acquired| acquired < target) {
        return Selection::CatchUp(target);
    }
    match latest_pending {
        Some(candidate) if candidate < PROVIDER_FLOOR => Selection::BoundExceeded(candidate),
        Some(candidate) => Selection::Backlog(candidate),
        None => Selection::Exhausted,
    }
}

pub async fn select_next_month<S>(store: &S, today: NaiveDate) -> Result<Selection, ScheduleError>
where
    S: StatusStore + ?Sized,
{
    if store.month_count().await? == 0 {
        return Err(ScheduleError::Uninitialized);
    }
    let latest_acquired = store.latest_acquired().await?;
    let latest_pending = store.latest_pending().await?;
    Ok(decide(catch_up_target(today), latest_acquired, latest_pending))
}
