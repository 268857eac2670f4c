//! Infrastructure layer: queue storage, claiming, alerting and config.

pub mod config;
pub mod db;
pub mod notify;
pub mod queue;

pub use config::{ClaimerConfig, ConfigError, QueueDbConfig};
pub use db::{InMemoryQueue, PgQueueConnection, QueueConnection, StoreError};
pub use notify::{
    Alert, AlertSink, InMemoryAlertSink, InMemoryStatusReporter, StatusReporter, ThrottledAlertSink,
    TracingAlertSink, TracingStatusReporter,
};
pub use queue::{ClaimError, ClaimSettings, MaintenanceError, QueueClaimer, QueueMaintenance, RetryPolicy};

mod integration_tests;
