//! Postgres backend for the status and aggregate stores.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use era5_core::{AggregateTarget, Cadence, ConsumerStatus, Month, MonthStatus};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::error::StoreError;
use crate::store::{quote_ident, AggregateStore, MonthCount, StatusStore};

#[derive(Debug, Clone)]
struct ConsumerColumn {
    target: String,
    quoted: String,
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    consumers: Vec<ConsumerColumn>,
}

impl PgStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
        targets: &[AggregateTarget],
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;
        Self::from_pool(pool, targets)
    }

    pub fn from_pool(pool: PgPool, targets: &[AggregateTarget]) -> Result<Self, StoreError> {
        let consumers = targets
            .iter()
            .map(|t| {
                Ok(ConsumerColumn {
                    target: t.name.clone(),
                    quoted: quote_ident(&t.status_column)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(Self { pool, consumers })
    }

    /// Applies embedded migrations, then adds a status column for every configured
    /// target the migrations do not already carry.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        for column in &self.consumers {
            let sql = format!(
                "ALTER TABLE month_status ADD COLUMN IF NOT EXISTS {col} TEXT CHECK ({col} IN ('in_progress', 'done'))",
                col = column.quoted
            );
            sqlx::query(&sql).execute(&self.pool).await?;
        }
        info!(consumers = self.consumers.len(), "month_status schema ready");
        Ok(())
    }

    fn column_for(&self, target: &AggregateTarget) -> Result<&str, StoreError> {
        self.consumers
            .iter()
            .find(|c| c.target == target.name)
            .map(|c| c.quoted.as_str())
            .ok_or_else(|| StoreError::InvalidIdentifier(target.name.clone()))
    }

    fn select_columns(&self) -> String {
        let mut columns = vec!["date", "path", "downloading", "downloading_since"]
            .into_iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        columns.extend(self.consumers.iter().map(|c| c.quoted.clone()));
        columns.join(", ")
    }

    fn decode_row(&self, row: &PgRow) -> Result<MonthStatus, StoreError> {
        let date: NaiveDate = row.try_get("date")?;
        let mut status = MonthStatus::new(to_month(date)?);
        status.path = row.try_get("path")?;
        status.downloading = row.try_get("downloading")?;
        status.downloading_since = row.try_get("downloading_since")?;
        for (offset, column) in self.consumers.iter().enumerate() {
            let raw: Option<String> = row.try_get(4 + offset)?;
            let value = raw
                .map(|s| s.parse::<ConsumerStatus>())
                .transpose()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            status.consumers.insert(column.target.clone(), value);
        }
        Ok(status)
    }
}

fn to_month(date: NaiveDate) -> Result<Month, StoreError> {
    Month::try_from(date).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn to_months(dates: Vec<NaiveDate>) -> Result<Vec<Month>, StoreError> {
    dates.into_iter().map(to_month).collect()
}

#[async_trait]
impl StatusStore for PgStore {
    async fn month_count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM month_status")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn insert_months(&self, months: &[Month]) -> Result<u64, StoreError> {
        let dates = months.iter().map(|m| m.first_day()).collect::<Vec<_>>();
        let result = sqlx::query(
            r#"
            INSERT INTO month_status (date)
            SELECT d FROM UNNEST($1::date[]) AS t(d)
            ON CONFLICT (date) DO NOTHING
            "#,
        )
        .bind(&dates)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn latest_acquired(&self) -> Result<Option<Month>, StoreError> {
        let date: Option<NaiveDate> =
            sqlx::query_scalar("SELECT MAX(date) FROM month_status WHERE path IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        date.map(to_month).transpose()
    }

    async fn latest_pending(&self) -> Result<Option<Month>, StoreError> {
        let date: Option<NaiveDate> = sqlx::query_scalar(
            "SELECT MAX(date) FROM month_status WHERE path IS NULL AND NOT downloading",
        )
        .fetch_one(&self.pool)
        .await?;
        date.map(to_month).transpose()
    }

    async fn try_claim(&self, month: Month, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE month_status
               SET downloading = true,
                   downloading_since = $2
             WHERE date = $1
               AND NOT downloading
               AND path IS NULL
            "#,
        )
        .bind(month.first_day())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_artifact(&self, month: Month, path: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE month_status
               SET path = $2,
                   downloading = false,
                   downloading_since = NULL
             WHERE date = $1
            "#,
        )
        .bind(month.first_day())
        .bind(path)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MissingMonth(month));
        }
        Ok(())
    }

    async fn release(&self, month: Month) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE month_status
               SET downloading = false,
                   downloading_since = NULL
             WHERE date = $1
            "#,
        )
        .bind(month.first_day())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_stale(&self, claimed_before: DateTime<Utc>) -> Result<Vec<Month>, StoreError> {
        let dates: Vec<NaiveDate> = sqlx::query_scalar(
            r#"
            UPDATE month_status
               SET downloading = false,
                   downloading_since = NULL
             WHERE downloading
               AND (downloading_since IS NULL OR downloading_since < $1)
            RETURNING date
            "#,
        )
        .bind(claimed_before)
        .fetch_all(&self.pool)
        .await?;
        to_months(dates)
    }

    async fn get(&self, month: Month) -> Result<Option<MonthStatus>, StoreError> {
        let sql = format!(
            "SELECT {} FROM month_status WHERE date = $1",
            self.select_columns()
        );
        let row = sqlx::query(&sql)
            .bind(month.first_day())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| self.decode_row(&r)).transpose()
    }

    async fn list(&self) -> Result<Vec<MonthStatus>, StoreError> {
        let sql = format!(
            "SELECT {} FROM month_status ORDER BY date",
            self.select_columns()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(|r| self.decode_row(r)).collect()
    }

    async fn begin_consume(&self, target: &AggregateTarget, month: Month) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE month_status SET {col} = 'in_progress' WHERE date = $1 AND path IS NOT NULL AND {col} IS NULL",
            col = self.column_for(target)?
        );
        let result = sqlx::query(&sql)
            .bind(month.first_day())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_consume(&self, target: &AggregateTarget, month: Month) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE month_status SET {col} = 'done' WHERE date = $1 AND {col} = 'in_progress'",
            col = self.column_for(target)?
        );
        let result = sqlx::query(&sql)
            .bind(month.first_day())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn next_unconsumed(&self, target: &AggregateTarget) -> Result<Option<Month>, StoreError> {
        let sql = format!(
            "SELECT MAX(date) FROM month_status WHERE path IS NOT NULL AND {} IS NULL",
            self.column_for(target)?
        );
        let date: Option<NaiveDate> = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        date.map(to_month).transpose()
    }

    async fn load_cadence(&self, task: &str) -> Result<Option<Cadence>, StoreError> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT cadence FROM scheduler_cadence WHERE task = $1")
                .bind(task)
                .fetch_optional(&self.pool)
                .await?;
        raw.map(|s| s.parse::<Cadence>())
            .transpose()
            .map_err(StoreError::Corrupt)
    }

    async fn save_cadence(&self, task: &str, cadence: Cadence) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_cadence (task, cadence, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (task) DO UPDATE
               SET cadence = EXCLUDED.cadence,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(task)
        .bind(cadence.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AggregateStore for PgStore {
    async fn monthly_counts(&self, target: &AggregateTarget) -> Result<Vec<MonthCount>, StoreError> {
        let sql = format!(
            r#"
            SELECT date_trunc('month', {ts}::timestamp)::date AS month, COUNT(*) AS rows
              FROM {table}
             GROUP BY 1
             ORDER BY 1
            "#,
            ts = quote_ident(&target.timestamp_column)?,
            table = quote_ident(&target.table)?,
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let month: NaiveDate = row.try_get("month")?;
            out.push(MonthCount {
                month: to_month(month)?,
                rows: row.try_get("rows")?,
            });
        }
        Ok(out)
    }

    async fn done_months(&self, target: &AggregateTarget) -> Result<Vec<Month>, StoreError> {
        let sql = format!(
            "SELECT date FROM month_status WHERE {} = 'done' ORDER BY date",
            self.column_for(target)?
        );
        let dates: Vec<NaiveDate> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        to_months(dates)
    }

    async fn purge_month(&self, target: &AggregateTarget, month: Month) -> Result<u64, StoreError> {
        let delete = format!(
            "DELETE FROM {table} WHERE {ts} >= $1 AND {ts} < $2",
            table = quote_ident(&target.table)?,
            ts = quote_ident(&target.timestamp_column)?,
        );
        let reset = format!(
            "UPDATE month_status SET {} = NULL WHERE date = $1",
            self.column_for(target)?
        );

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(&delete)
            .bind(month.first_day())
            .bind(month.succ().first_day())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query(&reset)
            .bind(month.first_day())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted)
    }
}
