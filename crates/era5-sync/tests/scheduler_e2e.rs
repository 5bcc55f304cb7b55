use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as Days, NaiveDate, TimeZone, Utc};
use era5_acquire::FixtureClient;
use era5_core::{AggregateTarget, Cadence, ConsumerStatus, Month};
use era5_storage::ArtifactStore;
use era5_sync::{
    calendar_end, effective_date, populate_calendar, select_next_month, AttemptOutcome, Coordinator, FailureKind,
    MemoryStore, Reconciler, ScheduleError, Selection, Services, StatusStore, SyncConfig, TickOutcome,
    ACQUISITION_TASK, MEMORY_DATABASE_URL,
};
use tempfile::tempdir;

fn month(y: i32, m: u32) -> Month {
    Month::from_ymd(y, m).unwrap()
}

async fn write_fixture(dir: &Path, m: Month) {
    ArtifactStore::new(dir)
        .store_bytes(m.first_day(), m.last_day(), "nc", b"CDF\x01 era5 fixture")
        .await
        .unwrap();
}

fn config(root: &Path) -> SyncConfig {
    SyncConfig {
        database_url: MEMORY_DATABASE_URL.to_string(),
        db_max_connections: 1,
        artifacts_dir: root.join("artifacts"),
        workspace_root: root.to_path_buf(),
        fixtures_dir: Some(root.join("fixtures")),
        cds_url: era5_acquire::DEFAULT_CDS_URL.to_string(),
        cds_key: None,
        user_agent: "era5-test".to_string(),
        http_timeout_secs: 5,
        poll_interval_secs: 1,
        catch_up_cron: "0 */15 * * * *".to_string(),
        steady_cron: "0 0 6 10 * *".to_string(),
        reconcile_cron: "0 0 4 * * *".to_string(),
        fetch_timeout_secs: 60,
        store_timeout_secs: 1,
        stale_grace_secs: 120,
        safety_margin_days: 8,
        max_retries: 0,
        retry_base_delay_secs: 1,
    }
}

#[tokio::test]
async fn empty_store_to_first_catch_up_acquisition() {
    let dir = tempdir().unwrap();
    let fixtures = dir.path().join("fixtures");
    write_fixture(&fixtures, month(2024, 2)).await;

    let store = MemoryStore::new(AggregateTarget::builtin());
    let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
    let today = effective_date(now, Duration::from_secs(8 * 86_400));

    let err = select_next_month(&store, today).await.unwrap_err();
    assert!(matches!(err, ScheduleError::Uninitialized));

    let created = populate_calendar(&store, calendar_end(today), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(created, 290);
    assert_eq!(store.get(month(2000, 1)).await.unwrap().unwrap().path, None);
    assert!(store.get(month(2024, 3)).await.unwrap().is_none());

    let selection = select_next_month(&store, today).await.unwrap();
    assert_eq!(selection, Selection::CatchUp(month(2024, 2)));

    let client = Arc::new(FixtureClient::new(ArtifactStore::new(&fixtures)));
    let coordinator = Coordinator::new(client, Duration::from_secs(5), Duration::from_secs(1));
    let outcome = coordinator.acquire(&store, month(2024, 2), now).await.unwrap();
    let AttemptOutcome::Acquired { artifact, .. } = outcome else {
        panic!("expected an acquisition, got {outcome:?}");
    };
    assert!(artifact.ends_with("2024/BR_20240201_20240229.nc"), "{artifact}");

    let row = store.get(month(2024, 2)).await.unwrap().unwrap();
    assert_eq!(row.path.as_deref(), Some(artifact.as_str()));
    assert!(!row.downloading);

    assert_eq!(
        select_next_month(&store, today).await.unwrap(),
        Selection::Backlog(month(2024, 1))
    );

    let err = coordinator.acquire(&store, month(2024, 1), now).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Empty);
    assert!(!store.get(month(2024, 1)).await.unwrap().unwrap().downloading);
    assert_eq!(
        select_next_month(&store, today).await.unwrap(),
        Selection::Backlog(month(2024, 1))
    );
}

#[tokio::test]
async fn services_degrade_cadence_once_backlog_is_exhausted() {
    let dir = tempdir().unwrap();
    let fixtures = dir.path().join("fixtures");
    let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
    for m in [month(2024, 1), month(2024, 2)] {
        write_fixture(&fixtures, m).await;
    }

    let services = Services::from_config(config(dir.path())).await.unwrap();
    assert_eq!(services.init(now).await.unwrap(), 290);
    for m in Month::range(month(2000, 1), month(2023, 12)) {
        services.store.record_artifact(m, "/archive/old.nc").await.unwrap();
    }

    let first = services.tick(now).await;
    assert!(matches!(first.outcome, TickOutcome::Acquired { month: m, .. } if m == month(2024, 2)));
    let second = services.tick(now).await;
    assert!(matches!(second.outcome, TickOutcome::Acquired { month: m, .. } if m == month(2024, 1)));

    let third = services.tick(now).await;
    assert_eq!(third.selection, Some(Selection::Exhausted));
    assert_eq!(third.outcome, TickOutcome::Idle);
    assert_eq!(third.desired_cadence, Some(Cadence::SteadyState));
    assert_eq!(
        services.store.load_cadence(ACQUISITION_TASK).await.unwrap(),
        Some(Cadence::SteadyState)
    );

    let report = services.status_report().await.unwrap();
    assert_eq!(report.summary.acquired, 290);
    assert_eq!(report.summary.pending, 0);
    assert!(report.reports_dir.join("status.md").exists());
}

#[tokio::test]
async fn reconciler_purges_partial_month_then_is_idempotent() {
    let target = AggregateTarget {
        name: "brasil".to_string(),
        table: "Municipio.copernicus_brasil".to_string(),
        timestamp_column: "date".to_string(),
        status_column: "brasil".to_string(),
        spatial_units: 10,
        samples_per_day: 1,
    };
    let foz = AggregateTarget::builtin().remove(1);
    let store = MemoryStore::new(vec![target.clone(), foz.clone()]);
    let m = month(2023, 11);
    store.insert_months(&[m]).await.unwrap();
    store.record_artifact(m, "/data/BR_20231101_20231130.nc").await.unwrap();
    for t in [&target, &foz] {
        assert!(store.begin_consume(t, m).await.unwrap());
        assert!(store.finish_consume(t, m).await.unwrap());
    }
    let days = |count: usize| -> Vec<NaiveDate> {
        (0..count)
            .map(|i| m.first_day() + Days::days((i % 30) as i64))
            .collect()
    };
    store.insert_aggregate_rows("brasil", days(280));
    store.insert_aggregate_rows("foz", days(30));

    let reconciler = Reconciler::new(vec![target.clone(), foz.clone()], Duration::from_secs(1));
    let report = reconciler.run(&store).await;
    assert_eq!(report.purged_months(), 1);
    assert_eq!(report.targets[0].purged[0].deleted, 280);

    assert_eq!(store.aggregate_rows_in("brasil", m), 0);
    let row = store.get(m).await.unwrap().unwrap();
    assert_eq!(row.consumer("brasil"), None);
    assert_eq!(row.consumer("foz"), Some(ConsumerStatus::Done));
    assert!(row.path.is_some());
    assert_eq!(store.next_unconsumed(&target).await.unwrap(), Some(m));

    let again = reconciler.run(&store).await;
    assert_eq!(again.purged_months(), 0);
    assert!(again.is_clean());
}
