//! Claiming queued rows for processing.
//!
//! One claim attempt runs in a single transaction:
//!
//! 1. short lock-wait timeout, then the non-blocking per-table claim lock
//! 2. gate: if any row is `running`, claim nothing
//! 3. skip-locked select of the best `queued` rows
//! 4. operational lock-wait timeout, mark the rows `running`, read them back
//! 5. commit (the claim lock is released with it)
//!
//! Attempts that hit lock contention are retried with backoff; any other
//! failure aborts the claim immediately.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use workclaim_core::{ClaimBatchSize, TableName, WorkItem};

use crate::db::connection::{QueueConnection, settle};
use crate::db::{StoreError, StoreResult};
use crate::notify::{Alert, AlertSink, StatusReporter};

use super::error::ClaimError;
use super::retry::RetryPolicy;

/// Timeouts and retry behaviour for [`QueueClaimer`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimSettings {
    pub retry: RetryPolicy,
    /// Lock-wait bound while taking the claim lock and selecting rows.
    pub claim_lock_timeout: Duration,
    /// Lock-wait bound restored before rows are updated.
    pub operational_lock_timeout: Duration,
    /// Pause before the next attempt when another worker holds the claim lock.
    pub claim_lock_retry_delay: Duration,
}

impl Default for ClaimSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            claim_lock_timeout: Duration::from_secs(30),
            operational_lock_timeout: Duration::from_secs(120),
            claim_lock_retry_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
enum AttemptOutcome {
    Claimed(Vec<WorkItem>),
    Idle(IdleReason),
    /// Another worker holds the claim lock.
    LockBusy,
}

#[derive(Debug, Clone, Copy)]
enum IdleReason {
    AlreadyRunning(u64),
    NoQueued,
}

/// Claims batches of queued rows for one worker process.
///
/// The claimer holds no connection state; every call works on the
/// caller-owned connection and leaves it outside any transaction.
pub struct QueueClaimer {
    settings: ClaimSettings,
    alerts: Arc<dyn AlertSink>,
    status: Option<Arc<dyn StatusReporter>>,
}

impl std::fmt::Debug for QueueClaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueClaimer")
            .field("settings", &self.settings)
            .field("status_reporter", &self.status.is_some())
            .finish_non_exhaustive()
    }
}

impl QueueClaimer {
    pub fn new(settings: ClaimSettings, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            settings,
            alerts,
            status: None,
        }
    }

    /// Report per-status counts whenever a claim comes back empty.
    pub fn with_status_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.status = Some(reporter);
        self
    }

    pub fn settings(&self) -> &ClaimSettings {
        &self.settings
    }

    /// Claim up to `max_rows` queued rows of `table`, best priority first.
    ///
    /// Returns an empty list when a row is already running, nothing is
    /// queued, or the claim lock stayed busy for every attempt. Claimed rows
    /// are `running` with `attempts` incremented once by the time this
    /// returns.
    ///
    /// The running gate admits one batch at a time, so with `max_rows > 1`
    /// several rows can be `running` together. `max_rows = 1` keeps a single
    /// running row per table.
    ///
    /// Attempts that find the claim lock busy use up the attempt budget but
    /// are not failures; the alert raised on exhaustion counts failed
    /// attempts only.
    pub async fn claim<C>(
        &self,
        conn: &mut C,
        table: &TableName,
        max_rows: ClaimBatchSize,
    ) -> Result<Vec<WorkItem>, ClaimError>
    where
        C: QueueConnection + ?Sized,
    {
        let retry = &self.settings.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut failures = 0u32;

        for attempt in 1..=max_attempts {
            match self.attempt_claim(conn, table, max_rows).await {
                Ok(AttemptOutcome::Claimed(items)) => {
                    info!(table = %table, attempt, claimed = items.len(), "claimed queued rows");
                    return Ok(items);
                }
                Ok(AttemptOutcome::Idle(reason)) => {
                    match reason {
                        IdleReason::AlreadyRunning(running) => {
                            debug!(table = %table, running, "a row is already running, skipping claim")
                        }
                        IdleReason::NoQueued => debug!(table = %table, "no queued rows"),
                    }
                    self.report_status(conn, table).await;
                    return Ok(Vec::new());
                }
                Ok(AttemptOutcome::LockBusy) => {
                    debug!(table = %table, attempt, "claim lock busy");
                    if attempt < max_attempts {
                        tokio::time::sleep(self.settings.claim_lock_retry_delay).await;
                    }
                }
                Err(err) if err.is_transient() && retry.should_retry(attempt) => {
                    failures += 1;
                    let delay = retry.delay_for_attempt(failures);
                    warn!(
                        table = %table,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "claim attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_transient() => {
                    failures += 1;
                    error!(
                        table = %table,
                        attempts = attempt,
                        failures,
                        error = %err,
                        "claim failed, retries exhausted"
                    );
                    self.alert(table, format!("Failed after {failures} attempts: {err}"));
                    return Err(ClaimError::ExhaustedRetries {
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => {
                    error!(
                        table = %table,
                        attempt,
                        kind = err.kind(),
                        error = %err,
                        "claim failed with non-retryable error"
                    );
                    self.alert(table, format!("Non-retryable failure on attempt {attempt}: {err}"));
                    return Err(ClaimError::Fatal {
                        attempt,
                        source: err,
                    });
                }
            }
        }

        debug!(table = %table, attempts = max_attempts, "claim lock busy on every attempt");
        Ok(Vec::new())
    }

    async fn attempt_claim<C>(
        &self,
        conn: &mut C,
        table: &TableName,
        max_rows: ClaimBatchSize,
    ) -> StoreResult<AttemptOutcome>
    where
        C: QueueConnection + ?Sized,
    {
        conn.begin().await?;
        let outcome = self.claim_in_transaction(conn, table, max_rows).await;
        settle(conn, table, outcome).await
    }

    async fn claim_in_transaction<C>(
        &self,
        conn: &mut C,
        table: &TableName,
        max_rows: ClaimBatchSize,
    ) -> StoreResult<AttemptOutcome>
    where
        C: QueueConnection + ?Sized,
    {
        conn.set_lock_timeout(self.settings.claim_lock_timeout).await?;
        if !conn.try_claim_lock(table).await? {
            return Ok(AttemptOutcome::LockBusy);
        }

        if let Some(running) = has_running_item(conn, table).await? {
            return Ok(AttemptOutcome::Idle(IdleReason::AlreadyRunning(running)));
        }

        self.try_claim_batch(conn, table, max_rows).await
    }

    async fn try_claim_batch<C>(
        &self,
        conn: &mut C,
        table: &TableName,
        max_rows: ClaimBatchSize,
    ) -> StoreResult<AttemptOutcome>
    where
        C: QueueConnection + ?Sized,
    {
        let ids = conn.select_queued_for_update(table, max_rows).await?;
        if ids.is_empty() {
            return Ok(AttemptOutcome::Idle(IdleReason::NoQueued));
        }

        conn.set_lock_timeout(self.settings.operational_lock_timeout)
            .await?;
        let updated = conn.mark_running(table, &ids).await?;
        if updated != ids.len() as u64 {
            // Locked rows cannot change status under us.
            return Err(StoreError::query(format!(
                "marked {updated} of {} selected rows running",
                ids.len()
            )));
        }

        let items = conn.fetch_claimed(table, &ids).await?;
        Ok(AttemptOutcome::Claimed(items))
    }

    async fn report_status<C>(&self, conn: &mut C, table: &TableName)
    where
        C: QueueConnection + ?Sized,
    {
        let Some(reporter) = &self.status else {
            return;
        };
        match conn.status_counts(table).await {
            Ok(counts) => reporter.report(table, counts),
            Err(err) => debug!(table = %table, error = %err, "status counts unavailable"),
        }
    }

    fn alert(&self, table: &TableName, details: String) {
        self.alerts.notify(
            Alert::new("Claim queued rows failed")
                .with_details(details)
                .with_context(format!("table={table}")),
        );
    }
}

/// Number of `running` rows, or `None` when nothing is running.
async fn has_running_item<C>(conn: &mut C, table: &TableName) -> StoreResult<Option<u64>>
where
    C: QueueConnection + ?Sized,
{
    let running = conn.count_running(table).await?;
    Ok((running > 0).then_some(running))
}
