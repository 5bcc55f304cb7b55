//! Month calendar population and the self-heal pass for abandoned claims.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use era5_core::{Month, PROVIDER_FLOOR};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::selector::catch_up_target;
use crate::store::{bounded, StatusStore};

/// The date the selector evaluates against: the provider publishes with a delay,
/// so a month is only due once `safety_margin` has passed after it ends.
pub fn effective_date(now: DateTime<Utc>, safety_margin: Duration) -> NaiveDate {
    let margin = chrono::Duration::from_std(safety_margin).unwrap_or_else(|_| chrono::Duration::zero());
    (now - margin).date_naive()
}

/// Last month the calendar should contain for `effective`.
pub fn calendar_end(effective: NaiveDate) -> Month {
    catch_up_target(effective)
}

/// Inserts every month in `[PROVIDER_FLOOR, end]` not present yet. Returns how many were created.
pub async fn populate_calendar<S>(store: &S, end: Month, store_timeout: Duration) -> Result<u64, StoreError>
where
    S: StatusStore + ?Sized,
{
    let months = Month::range(PROVIDER_FLOOR, end);
    if months.is_empty() {
        return Ok(0);
    }
    let created = bounded(store_timeout, "insert_months", store.insert_months(&months)).await?;
    if created > 0 {
        info!(created, from = %PROVIDER_FLOOR, to = %end, "month calendar populated");
    }
    Ok(created)
}

/// Clears claims older than `grace`. A claim that old cannot belong to a live
/// attempt as long as `grace` exceeds the fetch timeout.
pub async fn heal_stale_downloads<S>(
    store: &S,
    now: DateTime<Utc>,
    grace: Duration,
    store_timeout: Duration,
) -> Result<Vec<Month>, StoreError>
where
    S: StatusStore + ?Sized,
{
    let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
    let healed = bounded(store_timeout, "release_stale", store.release_stale(now - grace)).await?;
    for month in &healed {
        warn!(%month, "cleared abandoned download claim");
    }
    Ok(healed)
}
