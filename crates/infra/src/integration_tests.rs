//! Integration tests for the full claim cycle.
//!
//! Tests: claim → process → record outcome → next claim
//!
//! Verifies:
//! - A running row gates further claims until its outcome is recorded
//! - Rows abandoned by a dead worker are recovered and claimed again
//! - Finished rows with a run interval come back into the queue
//! - Alerts pass through the throttled sink

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use workclaim_core::{ClaimBatchSize, JobOutcome, TableName, WorkItemId, WorkStatus};

    use crate::config::ClaimerConfig;
    use crate::db::{FaultPoint, InMemoryQueue, StoreError, WorkRecord};
    use crate::notify::{InMemoryAlertSink, InMemoryStatusReporter, ThrottledAlertSink};
    use crate::queue::{QueueClaimer, QueueMaintenance};

    struct Harness {
        queue: InMemoryQueue,
        table: TableName,
        batch: ClaimBatchSize,
        claimer: QueueClaimer,
        maintenance: QueueMaintenance,
        alerts: Arc<ThrottledAlertSink<InMemoryAlertSink>>,
        reporter: Arc<InMemoryStatusReporter>,
    }

    fn setup(batch: u32) -> Harness {
        workclaim_observability::init_with_filter("workclaim_infra=debug");

        let batch = batch.to_string();
        let config = ClaimerConfig::from_lookup(|key| match key {
            "CLAIM_BATCH_SIZE" => Some(batch.clone()),
            _ => None,
        })
        .unwrap();
        let alerts = Arc::new(ThrottledAlertSink::new(
            InMemoryAlertSink::new(),
            config.alert_cooldown,
        ));
        let reporter = Arc::new(InMemoryStatusReporter::new());
        let claimer = QueueClaimer::new(config.claim_settings(), alerts.clone())
            .with_status_reporter(reporter.clone());
        let maintenance = QueueMaintenance::new(config.retry.clone(), alerts.clone());

        let queue = InMemoryQueue::new();
        queue.create_table(&config.table);

        Harness {
            queue,
            table: config.table,
            batch: config.batch_size,
            claimer,
            maintenance,
            alerts,
            reporter,
        }
    }

    #[tokio::test]
    async fn running_row_gates_claims_until_outcome_is_recorded() {
        let h = setup(1);
        h.queue.insert(&h.table, WorkRecord::queued(1, 10));
        h.queue.insert(&h.table, WorkRecord::queued(2, 5));
        let mut conn = h.queue.connect();

        let first = h.claimer.claim(&mut conn, &h.table, h.batch).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, WorkItemId::new(1));

        let blocked = h.claimer.claim(&mut conn, &h.table, h.batch).await.unwrap();
        assert!(blocked.is_empty());
        assert_eq!(h.reporter.all().len(), 1);

        let done = JobOutcome::Done {
            output_path: Some("/data/out/1.json".into()),
        };
        assert!(h
            .maintenance
            .record_outcome(&mut conn, &h.table, first[0].id, &done)
            .await
            .unwrap());

        let second = h.claimer.claim(&mut conn, &h.table, h.batch).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, WorkItemId::new(2));

        let counts = h.maintenance.status_counts(&mut conn, &h.table).await.unwrap();
        assert_eq!((counts.done, counts.running, counts.queued), (1, 1, 0));
        assert!(!h.maintenance.any_queued(&mut conn, &h.table).await.unwrap());
    }

    #[tokio::test]
    async fn abandoned_rows_are_reclaimed_and_claimed_again() {
        let h = setup(5);
        h.queue.insert(
            &h.table,
            WorkRecord::queued(3, 0)
                .with_status(WorkStatus::Running)
                .with_updated_at(Utc::now() - chrono::Duration::minutes(15)),
        );
        h.queue.insert(&h.table, WorkRecord::queued(4, 0));
        let mut conn = h.queue.connect();

        assert!(h.claimer.claim(&mut conn, &h.table, h.batch).await.unwrap().is_empty());

        let reclaimed = h
            .maintenance
            .reclaim_stale_running(&mut conn, &h.table, 2)
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);

        let items = h.claimer.claim(&mut conn, &h.table, h.batch).await.unwrap();
        let ids: Vec<i64> = items.iter().map(|item| item.id.get()).collect();
        assert_eq!(ids, vec![3, 4]);
        let reclaimed_row = items.iter().find(|item| item.id.get() == 3).unwrap();
        assert_eq!(reclaimed_row.attempts, 1);
    }

    #[tokio::test]
    async fn finished_rows_with_interval_are_requeued() {
        let h = setup(5);
        h.queue.insert(
            &h.table,
            WorkRecord::queued(8, 0)
                .with_status(WorkStatus::Done)
                .with_source("sites", 80)
                .with_run_interval(60)
                .with_processed_at(Utc::now() - chrono::Duration::minutes(90)),
        );
        let mut conn = h.queue.connect();

        assert_eq!(h.maintenance.auto_requeue_due(&mut conn, &h.table).await.unwrap(), 1);

        let items = h.claimer.claim(&mut conn, &h.table, h.batch).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].source_table.as_deref(), Some("sites"));
        assert_eq!(items[0].source_id, Some(80));
        assert_eq!(items[0].run_interval_minutes, Some(60));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_raise_a_single_alert_within_cooldown() {
        let h = setup(1);
        h.queue.insert(&h.table, WorkRecord::queued(1, 0));
        let mut conn = h.queue.connect();
        conn.inject_failure(
            FaultPoint::SelectQueued,
            StoreError::contention("lock timeout"),
            6,
        );

        assert!(h.claimer.claim(&mut conn, &h.table, h.batch).await.is_err());
        assert!(h.claimer.claim(&mut conn, &h.table, h.batch).await.is_err());
        assert_eq!(h.alerts.inner().all().len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        let items = h.claimer.claim(&mut conn, &h.table, h.batch).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(
            h.queue.row(&h.table, WorkItemId::new(1)).unwrap().attempts,
            1
        );
    }
}
