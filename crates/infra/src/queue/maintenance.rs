//! Housekeeping around the claim cycle: status counts, stale-row recovery,
//! interval re-queueing and recording processing outcomes.

use std::sync::Arc;

use tracing::{error, info, warn};

use workclaim_core::{JobOutcome, StatusCounts, TableName, WorkItemId};

use crate::db::connection::{QueueConnection, settle};
use crate::db::StoreResult;
use crate::notify::{Alert, AlertSink};

use super::error::MaintenanceError;
use super::retry::RetryPolicy;

/// Queue housekeeping operations.
///
/// Each call runs in its own short transaction on the caller's connection.
pub struct QueueMaintenance {
    retry: RetryPolicy,
    alerts: Arc<dyn AlertSink>,
}

impl std::fmt::Debug for QueueMaintenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMaintenance")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl QueueMaintenance {
    pub fn new(retry: RetryPolicy, alerts: Arc<dyn AlertSink>) -> Self {
        Self { retry, alerts }
    }

    pub async fn status_counts<C>(
        &self,
        conn: &mut C,
        table: &TableName,
    ) -> Result<StatusCounts, MaintenanceError>
    where
        C: QueueConnection + ?Sized,
    {
        conn.begin().await?;
        let result = conn.status_counts(table).await;
        Ok(settle(conn, table, result).await?)
    }

    pub async fn any_queued<C>(&self, conn: &mut C, table: &TableName) -> Result<bool, MaintenanceError>
    where
        C: QueueConnection + ?Sized,
    {
        conn.begin().await?;
        let result = conn.count_queued(table).await;
        Ok(settle(conn, table, result).await? > 0)
    }

    /// Put `running` rows untouched for `minutes` back in the queue.
    ///
    /// Such rows belong to workers that died mid-job. Returns the number of
    /// rows re-queued; `minutes == 0` disables the sweep.
    pub async fn reclaim_stale_running<C>(
        &self,
        conn: &mut C,
        table: &TableName,
        minutes: u32,
    ) -> Result<u64, MaintenanceError>
    where
        C: QueueConnection + ?Sized,
    {
        if minutes == 0 {
            return Ok(0);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match reclaim_once(conn, table, minutes).await {
                Ok(reclaimed) => {
                    if reclaimed > 0 {
                        info!(table = %table, reclaimed, minutes, "re-queued stale running rows");
                    }
                    return Ok(reclaimed);
                }
                Err(err) => err,
            };

            if err.is_transient() && self.retry.should_retry(attempt) {
                let delay = self.retry.delay_for_attempt(attempt);
                warn!(
                    table = %table,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "reclaim attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            error!(table = %table, attempt, error = %err, "reclaim stale running rows failed");
            self.alerts.notify(
                Alert::new("Reclaim stale-running error")
                    .with_details(err.to_string())
                    .with_context(format!("table={table} minutes={minutes}")),
            );
            return Err(if err.is_transient() {
                MaintenanceError::ExhaustedRetries {
                    operation: "reclaim_stale_running",
                    attempts: attempt,
                    source: err,
                }
            } else {
                MaintenanceError::Store(err)
            });
        }
    }

    /// Re-queue finished rows whose run interval has elapsed.
    pub async fn auto_requeue_due<C>(&self, conn: &mut C, table: &TableName) -> Result<u64, MaintenanceError>
    where
        C: QueueConnection + ?Sized,
    {
        let result = match conn.begin().await {
            Ok(()) => {
                let result = conn.requeue_due(table).await;
                settle(conn, table, result).await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(requeued) => {
                if requeued > 0 {
                    info!(table = %table, requeued, "re-queued rows due by run interval");
                }
                Ok(requeued)
            }
            Err(err) => {
                error!(table = %table, error = %err, "auto requeue failed");
                self.alerts.notify(
                    Alert::new("Auto requeue error")
                        .with_details(err.to_string())
                        .with_context(format!("table={table}")),
                );
                Err(err.into())
            }
        }
    }

    /// Record the outcome of processing `id`. Returns `false` when no such
    /// row exists.
    pub async fn record_outcome<C>(
        &self,
        conn: &mut C,
        table: &TableName,
        id: WorkItemId,
        outcome: &JobOutcome,
    ) -> Result<bool, MaintenanceError>
    where
        C: QueueConnection + ?Sized,
    {
        let result = match conn.begin().await {
            Ok(()) => {
                let result = conn.update_status(table, id, outcome).await;
                settle(conn, table, result).await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(updated) => {
                if !updated {
                    warn!(table = %table, id = %id, "no row to record outcome on");
                }
                Ok(updated)
            }
            Err(err) => {
                let status = outcome.status();
                error!(table = %table, id = %id, status = %status, error = %err, "update job status failed");
                self.alerts.notify(
                    Alert::new("Update job status failed")
                        .with_details(err.to_string())
                        .with_context(format!("job_id={id} status={status}")),
                );
                Err(err.into())
            }
        }
    }
}

async fn reclaim_once<C>(conn: &mut C, table: &TableName, minutes: u32) -> StoreResult<u64>
where
    C: QueueConnection + ?Sized,
{
    conn.begin().await?;
    let result = conn.reclaim_stale_running(table, minutes).await;
    settle(conn, table, result).await
}
