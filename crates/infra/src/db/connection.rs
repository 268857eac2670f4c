//! Connection contract required by the claimer and maintenance operations.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use workclaim_core::{ClaimBatchSize, JobOutcome, StatusCounts, TableName, WorkItem, WorkItemId};

use super::error::StoreResult;

/// A caller-owned, transactional connection to the queue database.
///
/// Implementations map each method onto one statement. Transaction control is
/// explicit: the claimer calls `begin` and always finishes with `commit` or
/// `rollback`, so the connection is clean whenever control returns to the
/// caller. Statements issued outside `begin`/`commit` run in autocommit mode.
#[async_trait]
pub trait QueueConnection: Send {
    async fn begin(&mut self) -> StoreResult<()>;

    async fn commit(&mut self) -> StoreResult<()>;

    async fn rollback(&mut self) -> StoreResult<()>;

    /// Bound how long statements in the current transaction wait for locks.
    async fn set_lock_timeout(&mut self, timeout: Duration) -> StoreResult<()>;

    /// Try to take the transaction-scoped claim lock for `table` without
    /// waiting. Released by `commit`/`rollback`.
    async fn try_claim_lock(&mut self, table: &TableName) -> StoreResult<bool>;

    /// Number of rows currently `running`.
    async fn count_running(&mut self, table: &TableName) -> StoreResult<u64>;

    /// Number of rows currently `queued`.
    async fn count_queued(&mut self, table: &TableName) -> StoreResult<u64>;

    /// Lock and return up to `limit` queued ids ordered by
    /// `(priority DESC, id ASC)`, skipping rows locked by other transactions.
    async fn select_queued_for_update(
        &mut self,
        table: &TableName,
        limit: ClaimBatchSize,
    ) -> StoreResult<Vec<WorkItemId>>;

    /// Move still-queued rows among `ids` to `running`, bumping `attempts`
    /// and `updated_at`. Returns the number of rows changed.
    async fn mark_running(&mut self, table: &TableName, ids: &[WorkItemId]) -> StoreResult<u64>;

    /// Claimed projections of `ids`, ordered by `(priority DESC, id ASC)`.
    async fn fetch_claimed(
        &mut self,
        table: &TableName,
        ids: &[WorkItemId],
    ) -> StoreResult<Vec<WorkItem>>;

    async fn status_counts(&mut self, table: &TableName) -> StoreResult<StatusCounts>;

    /// Re-queue `running` rows untouched for at least `minutes`.
    async fn reclaim_stale_running(&mut self, table: &TableName, minutes: u32) -> StoreResult<u64>;

    /// Re-queue finished rows whose `run_interval_minutes` has elapsed.
    async fn requeue_due(&mut self, table: &TableName) -> StoreResult<u64>;

    /// Record a processing outcome. Returns `false` when no row has `id`.
    async fn update_status(
        &mut self,
        table: &TableName,
        id: WorkItemId,
        outcome: &JobOutcome,
    ) -> StoreResult<bool>;
}

/// Roll back, logging instead of returning a rollback failure so the error
/// that caused it is the one the caller sees.
pub(crate) async fn rollback_quietly<C>(conn: &mut C, table: &TableName)
where
    C: QueueConnection + ?Sized,
{
    if let Err(err) = conn.rollback().await {
        warn!(table = %table, error = %err, "rollback failed");
    }
}

/// Commit on success, roll back on failure (including a failed commit).
pub(crate) async fn settle<C, T>(conn: &mut C, table: &TableName, result: StoreResult<T>) -> StoreResult<T>
where
    C: QueueConnection + ?Sized,
    T: Send,
{
    match result {
        Ok(value) => match conn.commit().await {
            Ok(()) => Ok(value),
            Err(err) => {
                rollback_quietly(conn, table).await;
                Err(err)
            }
        },
        Err(err) => {
            rollback_quietly(conn, table).await;
            Err(err)
        }
    }
}
