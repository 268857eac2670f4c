//! Postgres-backed queue connection.
//!
//! The queue table is owned elsewhere; statements assume these columns:
//!
//! | column | type |
//! |--------|------|
//! | `id` | `BIGINT` primary key |
//! | `link`, `the_css` | `TEXT` (nullable, read as empty) |
//! | `priority`, `attempts` | `INTEGER` |
//! | `source_table` | `TEXT NULL` |
//! | `source_id` | `BIGINT NULL` |
//! | `run_interval_minutes` | `INTEGER NULL` |
//! | `status` | `TEXT` (`queued`/`running`/`done`/`error`) |
//! | `output_json_path`, `last_error` | `TEXT NULL` |
//! | `created_at`, `updated_at`, `processed_at` | `TIMESTAMPTZ` |
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database | `55P03` lock_not_available, `40P01` deadlock, `40001` serialization, `57014` query_canceled | `Contention` |
//! | Database | class `08` connection exception, `57P01`..`57P03` shutdown | `Connection` |
//! | Database | any other | `Query` |
//! | Io, Tls, Protocol, PoolTimedOut, PoolClosed, WorkerCrashed | N/A | `Connection` |
//! | ColumnDecode, ColumnNotFound, Decode, TypeNotFound | N/A | `Decode` |
//! | Other | N/A | `Query` |

use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use tracing::instrument;

use workclaim_core::{ClaimBatchSize, JobOutcome, StatusCounts, TableName, WorkItem, WorkItemId};

use super::connection::QueueConnection;
use super::error::{StoreError, StoreResult};
use crate::config::QueueDbConfig;

/// Build the connection pool workers acquire queue connections from.
pub async fn connect_pool(config: &QueueDbConfig) -> StoreResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))
}

/// A pooled Postgres connection speaking the queue protocol.
///
/// The wrapped connection stays caller-owned: dropping this value returns it
/// to the pool, and nothing here closes it.
#[derive(Debug)]
pub struct PgQueueConnection {
    conn: PoolConnection<Postgres>,
}

impl PgQueueConnection {
    pub fn new(conn: PoolConnection<Postgres>) -> Self {
        Self { conn }
    }

    /// Acquire a connection from `pool`.
    pub async fn acquire(pool: &PgPool) -> StoreResult<Self> {
        let conn = pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        Ok(Self::new(conn))
    }

    pub fn into_inner(self) -> PoolConnection<Postgres> {
        self.conn
    }

    async fn execute_statement(&mut self, operation: &'static str, sql: &str) -> StoreResult<()> {
        sqlx::query(sql)
            .persistent(false)
            .execute(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(())
    }

    async fn count_with_status(
        &mut self,
        operation: &'static str,
        table: &TableName,
        status: &str,
    ) -> StoreResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) AS row_count FROM {} WHERE status = $1",
            table.quoted()
        );
        let row = sqlx::query(&sql)
            .bind(status)
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        let count: i64 = row
            .try_get("row_count")
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(count.max(0) as u64)
    }
}

/// `SET` does not accept bind parameters, so the value is inlined. Postgres
/// reads `0` as "wait forever"; anything shorter than 1 ms is raised to 1 ms.
fn lock_timeout_statement(timeout: Duration) -> String {
    format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis().max(1))
}

fn id_params(ids: &[WorkItemId]) -> Vec<i64> {
    ids.iter().map(|id| id.get()).collect()
}

#[async_trait]
impl QueueConnection for PgQueueConnection {
    async fn begin(&mut self) -> StoreResult<()> {
        self.execute_statement("begin", "BEGIN").await
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.execute_statement("commit", "COMMIT").await
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.execute_statement("rollback", "ROLLBACK").await
    }

    async fn set_lock_timeout(&mut self, timeout: Duration) -> StoreResult<()> {
        self.execute_statement("set_lock_timeout", &lock_timeout_statement(timeout))
            .await
    }

    #[instrument(skip(self), fields(table = %table), err)]
    async fn try_claim_lock(&mut self, table: &TableName) -> StoreResult<bool> {
        let row = sqlx::query("SELECT pg_try_advisory_xact_lock(hashtext($1)) AS locked")
            .bind(table.claim_lock_name())
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("try_claim_lock", e))?;
        row.try_get("locked")
            .map_err(|e| map_sqlx_error("try_claim_lock", e))
    }

    #[instrument(skip(self), fields(table = %table), err)]
    async fn count_running(&mut self, table: &TableName) -> StoreResult<u64> {
        self.count_with_status("count_running", table, "running").await
    }

    #[instrument(skip(self), fields(table = %table), err)]
    async fn count_queued(&mut self, table: &TableName) -> StoreResult<u64> {
        self.count_with_status("count_queued", table, "queued").await
    }

    #[instrument(skip(self), fields(table = %table, limit = limit.get()), err)]
    async fn select_queued_for_update(
        &mut self,
        table: &TableName,
        limit: ClaimBatchSize,
    ) -> StoreResult<Vec<WorkItemId>> {
        let sql = format!(
            r#"
            SELECT id
            FROM {}
            WHERE status = 'queued'
            ORDER BY priority DESC, id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
            table.quoted()
        );
        let ids: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(i64::from(limit.get()))
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("select_queued_for_update", e))?;
        Ok(ids.into_iter().map(WorkItemId::new).collect())
    }

    #[instrument(skip(self, ids), fields(table = %table, ids = ids.len()), err)]
    async fn mark_running(&mut self, table: &TableName, ids: &[WorkItemId]) -> StoreResult<u64> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = 'running',
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = ANY($1)
              AND status = 'queued'
            "#,
            table.quoted()
        );
        let result = sqlx::query(&sql)
            .bind(id_params(ids))
            .execute(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("mark_running", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, ids), fields(table = %table, ids = ids.len()), err)]
    async fn fetch_claimed(
        &mut self,
        table: &TableName,
        ids: &[WorkItemId],
    ) -> StoreResult<Vec<WorkItem>> {
        let sql = format!(
            r#"
            SELECT
                id,
                COALESCE(link, '') AS link,
                COALESCE(the_css, '') AS the_css,
                priority,
                attempts,
                source_table,
                source_id,
                run_interval_minutes
            FROM {}
            WHERE id = ANY($1)
            ORDER BY priority DESC, id ASC
            "#,
            table.quoted()
        );
        let rows = sqlx::query(&sql)
            .bind(id_params(ids))
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("fetch_claimed", e))?;

        rows.iter()
            .map(work_item_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("fetch_claimed", e))
    }

    #[instrument(skip(self), fields(table = %table), err)]
    async fn status_counts(&mut self, table: &TableName) -> StoreResult<StatusCounts> {
        let sql = format!(
            "SELECT status, COUNT(*) AS row_count FROM {} GROUP BY status",
            table.quoted()
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("status_counts", e))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: Option<String> = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("status_counts", e))?;
            let count: i64 = row
                .try_get("row_count")
                .map_err(|e| map_sqlx_error("status_counts", e))?;
            counts.record(status.as_deref().unwrap_or_default(), count.max(0) as u64);
        }
        Ok(counts)
    }

    #[instrument(skip(self), fields(table = %table), err)]
    async fn reclaim_stale_running(&mut self, table: &TableName, minutes: u32) -> StoreResult<u64> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = 'queued', updated_at = NOW()
            WHERE status = 'running'
              AND updated_at < NOW() - make_interval(mins => $1)
            "#,
            table.quoted()
        );
        let minutes = i32::try_from(minutes).unwrap_or(i32::MAX);
        let result = sqlx::query(&sql)
            .bind(minutes)
            .execute(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("reclaim_stale_running", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(table = %table), err)]
    async fn requeue_due(&mut self, table: &TableName) -> StoreResult<u64> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = 'queued', updated_at = NOW()
            WHERE run_interval_minutes IS NOT NULL
              AND run_interval_minutes > 0
              AND status IN ('done', 'error')
              AND COALESCE(processed_at, updated_at, created_at)
                  <= NOW() - make_interval(mins => run_interval_minutes)
            "#,
            table.quoted()
        );
        let result = sqlx::query(&sql)
            .execute(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("requeue_due", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, outcome), fields(table = %table, id = %id, status = %outcome.status()), err)]
    async fn update_status(
        &mut self,
        table: &TableName,
        id: WorkItemId,
        outcome: &JobOutcome,
    ) -> StoreResult<bool> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = $1::text,
                output_json_path = COALESCE($2::text, output_json_path),
                last_error = $3::text,
                processed_at = CASE WHEN $1::text IN ('done', 'error') THEN NOW() ELSE processed_at END,
                updated_at = CASE WHEN $1::text = 'done' THEN NOW() ELSE updated_at END
            WHERE id = $4
            "#,
            table.quoted()
        );
        let result = sqlx::query(&sql)
            .bind(outcome.status().as_str())
            .bind(outcome.output_path())
            .bind(outcome.error_message())
            .bind(id.get())
            .execute(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("update_status", e))?;
        Ok(result.rows_affected() > 0)
    }
}

fn work_item_from_row(row: &PgRow) -> Result<WorkItem, sqlx::Error> {
    Ok(WorkItem {
        id: WorkItemId::new(row.try_get("id")?),
        link: row.try_get("link")?,
        css_selector: row.try_get("the_css")?,
        priority: row.try_get("priority")?,
        attempts: row.try_get("attempts")?,
        source_table: row.try_get("source_table")?,
        source_id: row.try_get("source_id")?,
        run_interval_minutes: row.try_get("run_interval_minutes")?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("55P03" | "40P01" | "40001" | "57014") => StoreError::Contention(msg),
                Some(code) if code.starts_with("08") => StoreError::Connection(msg),
                Some("57P01" | "57P02" | "57P03") => StoreError::Connection(msg),
                _ => StoreError::Query(msg),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            StoreError::Connection(format!("{} in {}", err, operation))
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => {
            StoreError::Decode(format!("{} in {}", err, operation))
        }
        _ => StoreError::Query(format!("sqlx error in {}: {}", operation, err)),
    }
}
