//! Operator-facing alerts and queue status reporting.
//!
//! Both are injected into the claimer and the maintenance operations so the
//! queue layer never decides where alerts go or how status is displayed.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info};

use workclaim_core::{StatusCounts, TableName};

/// Longest `details` text forwarded by [`ThrottledAlertSink`].
pub const MAX_ALERT_DETAILS_CHARS: usize = 1500;

const TRUNCATED_SUFFIX: &str = " …[truncated]";

/// An operator alert for a failure the queue layer could not recover from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub title: String,
    pub details: Option<String>,
    pub context: Option<String>,
    /// Subject to the sink's cooldown.
    pub throttle: bool,
}

impl Alert {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            details: None,
            context: None,
            throttle: true,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Bypass cooldowns.
    pub fn unthrottled(mut self) -> Self {
        self.throttle = false;
        self
    }
}

/// Destination for operator alerts.
///
/// Delivery is best-effort: a sink must not fail the operation that raised
/// the alert.
pub trait AlertSink: Send + Sync + 'static {
    fn notify(&self, alert: Alert);
}

/// Sink that writes alerts to the log at `error` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn notify(&self, alert: Alert) {
        error!(
            title = %alert.title,
            context = alert.context.as_deref().unwrap_or_default(),
            details = alert.details.as_deref().unwrap_or_default(),
            "alert"
        );
    }
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAlertSink {
    inner: Mutex<Vec<Alert>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Alert> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AlertSink for InMemoryAlertSink {
    fn notify(&self, alert: Alert) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert);
    }
}

/// Wraps a sink with a cooldown shared by all throttled alerts and caps the
/// size of forwarded details.
///
/// A throttled alert raised within `cooldown` of the previous forwarded
/// throttled alert is dropped. Unthrottled alerts always pass and do not
/// restart the cooldown.
#[derive(Debug)]
pub struct ThrottledAlertSink<S> {
    inner: S,
    cooldown: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl<S: AlertSink> ThrottledAlertSink<S> {
    pub fn new(inner: S, cooldown: Duration) -> Self {
        Self {
            inner,
            cooldown,
            last_sent: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn admit(&self) -> bool {
        let now = Instant::now();
        let mut last_sent = self
            .last_sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *last_sent {
            Some(at) if now.duration_since(at) < self.cooldown => false,
            _ => {
                *last_sent = Some(now);
                true
            }
        }
    }
}

impl<S: AlertSink> AlertSink for ThrottledAlertSink<S> {
    fn notify(&self, mut alert: Alert) {
        if alert.throttle && !self.admit() {
            return;
        }
        alert.details = alert.details.map(truncate_details);
        self.inner.notify(alert);
    }
}

fn truncate_details(details: String) -> String {
    match details.char_indices().nth(MAX_ALERT_DETAILS_CHARS) {
        Some((cut, _)) => format!("{}{}", &details[..cut], TRUNCATED_SUFFIX),
        None => details,
    }
}

/// Receives per-status row counts when a claim comes back empty.
pub trait StatusReporter: Send + Sync + 'static {
    fn report(&self, table: &TableName, counts: StatusCounts);
}

/// Reporter that logs counts at `info` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusReporter;

impl StatusReporter for TracingStatusReporter {
    fn report(&self, table: &TableName, counts: StatusCounts) {
        info!(
            table = %table,
            queued = counts.queued,
            running = counts.running,
            done = counts.done,
            error = counts.error,
            other = counts.other,
            "queue status"
        );
    }
}

/// In-memory reporter for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryStatusReporter {
    inner: Mutex<Vec<(String, StatusCounts)>>,
}

impl InMemoryStatusReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<(String, StatusCounts)> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StatusReporter for InMemoryStatusReporter {
    fn report(&self, table: &TableName, counts: StatusCounts) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((table.as_str().to_string(), counts));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn throttled_alerts_respect_cooldown() {
        let sink = ThrottledAlertSink::new(InMemoryAlertSink::new(), Duration::from_secs(60));

        sink.notify(Alert::new("first"));
        sink.notify(Alert::new("suppressed"));
        tokio::time::advance(Duration::from_secs(61)).await;
        sink.notify(Alert::new("after cooldown"));

        let titles: Vec<_> = sink.inner().all().into_iter().map(|a| a.title).collect();
        assert_eq!(titles, vec!["first", "after cooldown"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unthrottled_alerts_always_pass() {
        let sink = ThrottledAlertSink::new(InMemoryAlertSink::new(), Duration::from_secs(60));

        sink.notify(Alert::new("first"));
        sink.notify(Alert::new("urgent").unthrottled());
        sink.notify(Alert::new("suppressed"));

        assert_eq!(sink.inner().all().len(), 2);
    }

    #[test]
    fn long_details_are_truncated() {
        let sink = ThrottledAlertSink::new(InMemoryAlertSink::new(), Duration::ZERO);
        let details = "é".repeat(MAX_ALERT_DETAILS_CHARS + 10);

        sink.notify(Alert::new("big").with_details(details));

        let forwarded = sink.inner().all()[0].details.clone().unwrap();
        assert!(forwarded.ends_with(TRUNCATED_SUFFIX));
        assert_eq!(
            forwarded.chars().count(),
            MAX_ALERT_DETAILS_CHARS + TRUNCATED_SUFFIX.chars().count()
        );
    }

    #[test]
    fn short_details_pass_unchanged() {
        let sink = ThrottledAlertSink::new(InMemoryAlertSink::new(), Duration::ZERO);

        sink.notify(
            Alert::new("small")
                .with_details("deadlock detected")
                .with_context("table=queue_websites"),
        );

        let alert = &sink.inner().all()[0];
        assert_eq!(alert.details.as_deref(), Some("deadlock detected"));
        assert_eq!(alert.context.as_deref(), Some("table=queue_websites"));
    }

    #[test]
    fn alerts_serialize_for_external_sinks() {
        let alert = Alert::new("Claim queued rows failed")
            .with_context("table=queue_websites")
            .unthrottled();

        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["title"], "Claim queued rows failed");
        assert_eq!(json["details"], serde_json::Value::Null);
        assert_eq!(json["throttle"], false);
    }

    #[test]
    fn reporter_records_table_and_counts() {
        let reporter = InMemoryStatusReporter::new();
        let table = TableName::new("queue_websites").unwrap();
        let counts = StatusCounts {
            queued: 2,
            ..Default::default()
        };

        reporter.report(&table, counts);

        assert_eq!(reporter.all(), vec![("queue_websites".to_string(), counts)]);
    }
}
