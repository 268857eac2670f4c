//! In-memory queue backend for tests/dev.
//!
//! Emulates the parts of a relational engine the claim protocol relies on:
//! per-connection transactions with staged writes, row locks honoured by
//! skip-locked reads, and a transaction-scoped claim lock per table. Failures
//! can be injected per statement to exercise the retry paths.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use workclaim_core::{
    ClaimBatchSize, JobOutcome, StatusCounts, TableName, WorkItem, WorkItemId, WorkStatus,
};

use super::connection::QueueConnection;
use super::error::{StoreError, StoreResult};

/// Full stored row of a queue table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkRecord {
    pub id: WorkItemId,
    pub link: String,
    pub css_selector: String,
    pub priority: i32,
    pub attempts: i32,
    pub source_table: Option<String>,
    pub source_id: Option<i64>,
    pub run_interval_minutes: Option<i32>,
    pub status: WorkStatus,
    pub output_json_path: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl WorkRecord {
    /// A freshly queued row.
    pub fn queued(id: i64, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: WorkItemId::new(id),
            link: format!("https://queue.invalid/items/{id}"),
            css_selector: "body".to_string(),
            priority,
            attempts: 0,
            source_table: None,
            source_id: None,
            run_interval_minutes: None,
            status: WorkStatus::Queued,
            output_json_path: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }

    pub fn with_status(mut self, status: WorkStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_source(mut self, table: impl Into<String>, id: i64) -> Self {
        self.source_table = Some(table.into());
        self.source_id = Some(id);
        self
    }

    pub fn with_run_interval(mut self, minutes: i32) -> Self {
        self.run_interval_minutes = Some(minutes);
        self
    }

    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }

    pub fn with_processed_at(mut self, at: DateTime<Utc>) -> Self {
        self.processed_at = Some(at);
        self
    }

    /// Projection handed to the processing step.
    pub fn to_work_item(&self) -> WorkItem {
        WorkItem {
            id: self.id,
            link: self.link.clone(),
            css_selector: self.css_selector.clone(),
            priority: self.priority,
            attempts: self.attempts,
            source_table: self.source_table.clone(),
            source_id: self.source_id,
            run_interval_minutes: self.run_interval_minutes,
        }
    }
}

/// Statement kinds that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Begin,
    Commit,
    SetLockTimeout,
    ClaimLock,
    CountRunning,
    CountQueued,
    SelectQueued,
    MarkRunning,
    FetchClaimed,
    StatusCounts,
    ReclaimStale,
    RequeueDue,
    UpdateStatus,
}

/// Transaction bookkeeping of one connection, for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxStats {
    pub begins: u32,
    pub commits: u32,
    pub rollbacks: u32,
    /// Lock timeouts in the order they were set.
    pub lock_timeouts: Vec<Duration>,
}

type ConnId = u64;
type Table = BTreeMap<WorkItemId, WorkRecord>;

#[derive(Debug, Default)]
struct QueueState {
    tables: HashMap<String, Table>,
    row_locks: HashMap<(String, WorkItemId), ConnId>,
    claim_locks: HashMap<String, ConnId>,
    next_conn: ConnId,
}

impl QueueState {
    fn release(&mut self, conn: ConnId) {
        self.row_locks.retain(|_, owner| *owner != conn);
        self.claim_locks.retain(|_, owner| *owner != conn);
    }
}

/// Shared queue database. Cloning shares the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_table(&self, table: &TableName) {
        self.state()
            .tables
            .entry(table.as_str().to_string())
            .or_default();
    }

    /// Insert or replace a committed row, creating the table if needed.
    pub fn insert(&self, table: &TableName, record: WorkRecord) {
        self.state()
            .tables
            .entry(table.as_str().to_string())
            .or_default()
            .insert(record.id, record);
    }

    pub fn row(&self, table: &TableName, id: WorkItemId) -> Option<WorkRecord> {
        self.state()
            .tables
            .get(table.as_str())
            .and_then(|rows| rows.get(&id).cloned())
    }

    /// Committed rows ordered by id.
    pub fn rows(&self, table: &TableName) -> Vec<WorkRecord> {
        self.state()
            .tables
            .get(table.as_str())
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count_with_status(&self, table: &TableName, status: WorkStatus) -> usize {
        self.rows(table).iter().filter(|r| r.status == status).count()
    }

    /// Whether any connection holds a row or claim lock.
    pub fn has_locks(&self) -> bool {
        let state = self.state();
        !state.row_locks.is_empty() || !state.claim_locks.is_empty()
    }

    /// Open a new connection with its own transaction state.
    pub fn connect(&self) -> InMemoryConnection {
        let id = {
            let mut state = self.state();
            state.next_conn += 1;
            state.next_conn
        };
        InMemoryConnection {
            id,
            queue: self.clone(),
            tx: None,
            faults: HashMap::new(),
            stats: TxStats::default(),
        }
    }
}

#[derive(Debug, Default)]
struct Transaction {
    staged: HashMap<(String, WorkItemId), WorkRecord>,
}

/// One session against an [`InMemoryQueue`].
#[derive(Debug)]
pub struct InMemoryConnection {
    id: ConnId,
    queue: InMemoryQueue,
    tx: Option<Transaction>,
    faults: HashMap<FaultPoint, VecDeque<StoreError>>,
    stats: TxStats,
}

impl InMemoryConnection {
    /// Make the next `times` executions of `point` fail with `error`.
    pub fn inject_failure(&mut self, point: FaultPoint, error: StoreError, times: usize) {
        self.faults
            .entry(point)
            .or_default()
            .extend(std::iter::repeat_n(error, times));
    }

    pub fn stats(&self) -> &TxStats {
        &self.stats
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    fn check_fault(&mut self, point: FaultPoint) -> StoreResult<()> {
        match self.faults.get_mut(&point).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Row as seen by this connection: its own staged write, else committed.
    fn visible(&self, state: &QueueState, table: &str, id: WorkItemId) -> Option<WorkRecord> {
        let key = (table.to_string(), id);
        self.tx
            .as_ref()
            .and_then(|tx| tx.staged.get(&key).cloned())
            .or_else(|| state.tables.get(table).and_then(|rows| rows.get(&id).cloned()))
    }

    fn visible_rows(&self, state: &QueueState, table: &TableName) -> StoreResult<Vec<WorkRecord>> {
        let rows = existing_table(state, table)?;
        Ok(rows
            .keys()
            .filter_map(|id| self.visible(state, table.as_str(), *id))
            .collect())
    }

    /// Stage a write inside the open transaction, or apply it immediately.
    fn write(&mut self, state: &mut QueueState, table: &TableName, record: WorkRecord) {
        let key = (table.as_str().to_string(), record.id);
        match self.tx.as_mut() {
            Some(tx) => {
                state.row_locks.insert(key.clone(), self.id);
                tx.staged.insert(key, record);
            }
            None => {
                if let Some(rows) = state.tables.get_mut(table.as_str()) {
                    rows.insert(record.id, record);
                }
            }
        }
    }

    fn locked_by_other(&self, state: &QueueState, table: &TableName, id: WorkItemId) -> bool {
        state
            .row_locks
            .get(&(table.as_str().to_string(), id))
            .is_some_and(|owner| *owner != self.id)
    }

    /// Apply `update` to every visible row matching `filter`, skipping or
    /// failing on rows locked elsewhere the way a blocked UPDATE would.
    fn update_where<F, U>(
        &mut self,
        table: &TableName,
        filter: F,
        update: U,
    ) -> StoreResult<u64>
    where
        F: Fn(&WorkRecord) -> bool,
        U: Fn(&mut WorkRecord),
    {
        let queue = self.queue.clone();
        let mut state = queue.state();
        let matching: Vec<WorkRecord> = self
            .visible_rows(&state, table)?
            .into_iter()
            .filter(|r| filter(r))
            .collect();

        if matching
            .iter()
            .any(|r| self.locked_by_other(&state, table, r.id))
        {
            return Err(StoreError::contention(
                "canceling statement due to lock timeout",
            ));
        }

        let mut changed = 0;
        for mut record in matching {
            update(&mut record);
            self.write(&mut state, table, record);
            changed += 1;
        }
        Ok(changed)
    }
}

impl Drop for InMemoryConnection {
    /// Closing a session aborts its transaction.
    fn drop(&mut self) {
        self.queue.state().release(self.id);
    }
}

fn existing_table<'s>(state: &'s QueueState, table: &TableName) -> StoreResult<&'s Table> {
    state
        .tables
        .get(table.as_str())
        .ok_or_else(|| StoreError::query(format!("relation \"{table}\" does not exist")))
}

fn claim_order(a: &WorkRecord, b: &WorkRecord) -> std::cmp::Ordering {
    b.priority.cmp(&a.priority).then(a.id.cmp(&b.id))
}

#[async_trait]
impl QueueConnection for InMemoryConnection {
    async fn begin(&mut self) -> StoreResult<()> {
        tokio::task::yield_now().await;
        self.check_fault(FaultPoint::Begin)?;
        if self.tx.is_some() {
            return Err(StoreError::query("there is already a transaction in progress"));
        }
        self.stats.begins += 1;
        self.tx = Some(Transaction::default());
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        tokio::task::yield_now().await;
        self.check_fault(FaultPoint::Commit)?;
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        self.stats.commits += 1;
        let mut state = self.queue.state();
        for ((table, id), record) in tx.staged {
            if let Some(rows) = state.tables.get_mut(&table) {
                rows.insert(id, record);
            }
        }
        state.release(self.id);
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        if self.tx.take().is_some() {
            self.stats.rollbacks += 1;
        }
        self.queue.state().release(self.id);
        Ok(())
    }

    async fn set_lock_timeout(&mut self, timeout: Duration) -> StoreResult<()> {
        self.check_fault(FaultPoint::SetLockTimeout)?;
        self.stats.lock_timeouts.push(timeout);
        Ok(())
    }

    async fn try_claim_lock(&mut self, table: &TableName) -> StoreResult<bool> {
        tokio::task::yield_now().await;
        self.check_fault(FaultPoint::ClaimLock)?;
        if self.tx.is_none() {
            // A transaction-scoped lock outside a transaction is released at once.
            return Ok(true);
        }
        let mut state = self.queue.state();
        let owner = state
            .claim_locks
            .entry(table.as_str().to_string())
            .or_insert(self.id);
        Ok(*owner == self.id)
    }

    async fn count_running(&mut self, table: &TableName) -> StoreResult<u64> {
        tokio::task::yield_now().await;
        self.check_fault(FaultPoint::CountRunning)?;
        let state = self.queue.state();
        let rows = self.visible_rows(&state, table)?;
        Ok(rows.iter().filter(|r| r.status == WorkStatus::Running).count() as u64)
    }

    async fn count_queued(&mut self, table: &TableName) -> StoreResult<u64> {
        tokio::task::yield_now().await;
        self.check_fault(FaultPoint::CountQueued)?;
        let state = self.queue.state();
        let rows = self.visible_rows(&state, table)?;
        Ok(rows.iter().filter(|r| r.status == WorkStatus::Queued).count() as u64)
    }

    async fn select_queued_for_update(
        &mut self,
        table: &TableName,
        limit: ClaimBatchSize,
    ) -> StoreResult<Vec<WorkItemId>> {
        tokio::task::yield_now().await;
        self.check_fault(FaultPoint::SelectQueued)?;
        let queue = self.queue.clone();
        let mut state = queue.state();
        let mut candidates: Vec<WorkRecord> = self
            .visible_rows(&state, table)?
            .into_iter()
            .filter(|r| r.status == WorkStatus::Queued)
            .filter(|r| !self.locked_by_other(&state, table, r.id))
            .collect();
        candidates.sort_by(claim_order);
        candidates.truncate(limit.as_usize());

        let ids: Vec<WorkItemId> = candidates.iter().map(|r| r.id).collect();
        if self.tx.is_some() {
            for id in &ids {
                state
                    .row_locks
                    .insert((table.as_str().to_string(), *id), self.id);
            }
        }
        Ok(ids)
    }

    async fn mark_running(&mut self, table: &TableName, ids: &[WorkItemId]) -> StoreResult<u64> {
        tokio::task::yield_now().await;
        self.check_fault(FaultPoint::MarkRunning)?;
        let ids: HashSet<WorkItemId> = ids.iter().copied().collect();
        let now = Utc::now();
        self.update_where(
            table,
            |r| ids.contains(&r.id) && r.status == WorkStatus::Queued,
            |r| {
                r.status = WorkStatus::Running;
                r.attempts += 1;
                r.updated_at = now;
            },
        )
    }

    async fn fetch_claimed(
        &mut self,
        table: &TableName,
        ids: &[WorkItemId],
    ) -> StoreResult<Vec<WorkItem>> {
        tokio::task::yield_now().await;
        self.check_fault(FaultPoint::FetchClaimed)?;
        let state = self.queue.state();
        existing_table(&state, table)?;
        let mut rows: Vec<WorkRecord> = ids
            .iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .filter_map(|id| self.visible(&state, table.as_str(), *id))
            .collect();
        rows.sort_by(claim_order);
        Ok(rows.iter().map(WorkRecord::to_work_item).collect())
    }

    async fn status_counts(&mut self, table: &TableName) -> StoreResult<StatusCounts> {
        tokio::task::yield_now().await;
        self.check_fault(FaultPoint::StatusCounts)?;
        let state = self.queue.state();
        let mut counts = StatusCounts::default();
        for row in self.visible_rows(&state, table)? {
            counts.record(row.status.as_str(), 1);
        }
        Ok(counts)
    }

    async fn reclaim_stale_running(&mut self, table: &TableName, minutes: u32) -> StoreResult<u64> {
        tokio::task::yield_now().await;
        self.check_fault(FaultPoint::ReclaimStale)?;
        let now = Utc::now();
        let cutoff = now - chrono::Duration::minutes(i64::from(minutes));
        self.update_where(
            table,
            |r| r.status == WorkStatus::Running && r.updated_at < cutoff,
            |r| {
                r.status = WorkStatus::Queued;
                r.updated_at = now;
            },
        )
    }

    async fn requeue_due(&mut self, table: &TableName) -> StoreResult<u64> {
        tokio::task::yield_now().await;
        self.check_fault(FaultPoint::RequeueDue)?;
        let now = Utc::now();
        self.update_where(
            table,
            |r| {
                let Some(interval) = r.run_interval_minutes.filter(|m| *m > 0) else {
                    return false;
                };
                let last = r.processed_at.unwrap_or(r.updated_at);
                r.status.is_finished() && now - last >= chrono::Duration::minutes(i64::from(interval))
            },
            |r| {
                r.status = WorkStatus::Queued;
                r.updated_at = now;
            },
        )
    }

    async fn update_status(
        &mut self,
        table: &TableName,
        id: WorkItemId,
        outcome: &JobOutcome,
    ) -> StoreResult<bool> {
        tokio::task::yield_now().await;
        self.check_fault(FaultPoint::UpdateStatus)?;
        let now = Utc::now();
        let status = outcome.status();
        let changed = self.update_where(
            table,
            |r| r.id == id,
            |r| {
                r.status = status;
                if let Some(path) = outcome.output_path() {
                    r.output_json_path = Some(path.to_string());
                }
                r.last_error = outcome.error_message().map(str::to_string);
                if status.is_finished() {
                    r.processed_at = Some(now);
                }
                if status == WorkStatus::Done {
                    r.updated_at = now;
                }
            },
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableName {
        TableName::new("queue_websites").unwrap()
    }

    fn seeded(priorities: &[(i64, i32)]) -> InMemoryQueue {
        let queue = InMemoryQueue::new();
        queue.create_table(&table());
        for (id, priority) in priorities {
            queue.insert(&table(), WorkRecord::queued(*id, *priority));
        }
        queue
    }

    #[tokio::test]
    async fn staged_writes_are_invisible_until_commit() {
        let queue = seeded(&[(1, 0)]);
        let mut writer = queue.connect();
        let mut reader = queue.connect();

        writer.begin().await.unwrap();
        let ids = writer
            .select_queued_for_update(&table(), ClaimBatchSize::new(1).unwrap())
            .await
            .unwrap();
        writer.mark_running(&table(), &ids).await.unwrap();

        assert_eq!(writer.count_running(&table()).await.unwrap(), 1);
        assert_eq!(reader.count_running(&table()).await.unwrap(), 0);

        writer.commit().await.unwrap();
        assert_eq!(reader.count_running(&table()).await.unwrap(), 1);
        assert!(!queue.has_locks());
    }

    #[tokio::test]
    async fn skip_locked_read_ignores_rows_held_elsewhere() {
        let queue = seeded(&[(1, 5), (2, 5), (3, 1)]);
        let mut first = queue.connect();
        let mut second = queue.connect();
        let two = ClaimBatchSize::new(2).unwrap();

        first.begin().await.unwrap();
        second.begin().await.unwrap();

        let a = first.select_queued_for_update(&table(), two).await.unwrap();
        let b = second.select_queued_for_update(&table(), two).await.unwrap();

        assert_eq!(a, vec![WorkItemId::new(1), WorkItemId::new(2)]);
        assert_eq!(b, vec![WorkItemId::new(3)]);

        second.rollback().await.unwrap();
        first.rollback().await.unwrap();
        assert!(!queue.has_locks());
    }

    #[tokio::test]
    async fn claim_lock_is_exclusive_and_released_on_rollback() {
        let queue = seeded(&[]);
        let mut first = queue.connect();
        let mut second = queue.connect();

        first.begin().await.unwrap();
        second.begin().await.unwrap();
        assert!(first.try_claim_lock(&table()).await.unwrap());
        assert!(!second.try_claim_lock(&table()).await.unwrap());

        first.rollback().await.unwrap();
        assert!(second.try_claim_lock(&table()).await.unwrap());
        second.commit().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_a_connection_releases_its_locks() {
        let queue = seeded(&[(1, 0)]);
        {
            let mut conn = queue.connect();
            conn.begin().await.unwrap();
            conn.try_claim_lock(&table()).await.unwrap();
            conn.select_queued_for_update(&table(), ClaimBatchSize::default())
                .await
                .unwrap();
            assert!(queue.has_locks());
        }
        assert!(!queue.has_locks());
        assert_eq!(queue.count_with_status(&table(), WorkStatus::Queued), 1);
    }

    #[tokio::test]
    async fn missing_table_is_a_query_error() {
        let queue = InMemoryQueue::new();
        let mut conn = queue.connect();

        let err = conn.count_running(&table()).await.unwrap_err();
        assert!(matches!(err, StoreError::Query(_)));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let queue = seeded(&[(1, 0)]);
        let mut conn = queue.connect();
        conn.inject_failure(FaultPoint::CountQueued, StoreError::contention("busy"), 2);

        assert!(conn.count_queued(&table()).await.is_err());
        assert!(conn.count_queued(&table()).await.is_err());
        assert_eq!(conn.count_queued(&table()).await.unwrap(), 1);
    }
}
