//! Work items and their lifecycle states.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::WorkItemId;

/// Lifecycle state of a queue row.
///
/// `queued -> running` belongs to the claimer; every other transition is made
/// by the processing step that consumes a claim.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Waiting to be claimed
    Queued,
    /// Claimed and being processed
    Running,
    /// Processed successfully
    Done,
    /// Processing failed
    Error,
}

impl WorkStatus {
    pub const ALL: [WorkStatus; 4] = [
        WorkStatus::Queued,
        WorkStatus::Running,
        WorkStatus::Done,
        WorkStatus::Error,
    ];

    /// Value stored in the `status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkStatus::Queued => "queued",
            WorkStatus::Running => "running",
            WorkStatus::Done => "done",
            WorkStatus::Error => "error",
        }
    }

    /// Whether a finished row may be re-queued by its run interval.
    pub fn is_finished(self) -> bool {
        matches!(self, WorkStatus::Done | WorkStatus::Error)
    }
}

impl core::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(WorkStatus::Queued),
            "running" => Ok(WorkStatus::Running),
            "done" => Ok(WorkStatus::Done),
            "error" => Ok(WorkStatus::Error),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Claimed projection of a queue row, as handed to the processing step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    /// Opaque resource reference to process.
    pub link: String,
    /// Opaque processing hint (`the_css` column).
    #[serde(rename = "the_css")]
    pub css_selector: String,
    pub priority: i32,
    /// Claim counter, already incremented for the claim that returned this item.
    pub attempts: i32,
    pub source_table: Option<String>,
    pub source_id: Option<i64>,
    /// Re-queue cadence for finished rows.
    pub run_interval_minutes: Option<i32>,
}

/// Row counts per status for one queue table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub running: u64,
    pub done: u64,
    pub error: u64,
    /// Rows whose status is outside the known lifecycle.
    pub other: u64,
}

impl StatusCounts {
    /// Add `count` rows carrying the raw `status` column value.
    pub fn record(&mut self, status: &str, count: u64) {
        match WorkStatus::from_str(status) {
            Ok(WorkStatus::Queued) => self.queued += count,
            Ok(WorkStatus::Running) => self.running += count,
            Ok(WorkStatus::Done) => self.done += count,
            Ok(WorkStatus::Error) => self.error += count,
            Err(_) => self.other += count,
        }
    }

    pub fn get(&self, status: WorkStatus) -> u64 {
        match status {
            WorkStatus::Queued => self.queued,
            WorkStatus::Running => self.running,
            WorkStatus::Done => self.done,
            WorkStatus::Error => self.error,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.running + self.done + self.error + self.other
    }
}

/// Result of processing a claimed item, recorded back onto its row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Finished; `output_path` replaces the stored output path when present.
    Done { output_path: Option<String> },
    /// Failed with an error message.
    Failed { error: String },
    /// Put back in the queue (e.g. the processor produced nothing).
    Requeue { reason: String },
}

impl JobOutcome {
    pub fn status(&self) -> WorkStatus {
        match self {
            JobOutcome::Done { .. } => WorkStatus::Done,
            JobOutcome::Failed { .. } => WorkStatus::Error,
            JobOutcome::Requeue { .. } => WorkStatus::Queued,
        }
    }

    pub fn output_path(&self) -> Option<&str> {
        match self {
            JobOutcome::Done { output_path } => output_path.as_deref(),
            _ => None,
        }
    }

    /// Message stored in `last_error`; cleared on success.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            JobOutcome::Done { .. } => None,
            JobOutcome::Failed { error } => Some(error),
            JobOutcome::Requeue { reason } => Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_column_values() {
        for status in WorkStatus::ALL {
            assert_eq!(status.as_str().parse::<WorkStatus>().unwrap(), status);
        }
        assert!(matches!(
            "paused".parse::<WorkStatus>(),
            Err(DomainError::UnknownStatus(_))
        ));
    }

    #[test]
    fn counts_bucket_unknown_statuses() {
        let mut counts = StatusCounts::default();
        counts.record("queued", 3);
        counts.record("running", 1);
        counts.record("done", 2);
        counts.record("paused", 4);

        assert_eq!(counts.get(WorkStatus::Queued), 3);
        assert_eq!(counts.get(WorkStatus::Error), 0);
        assert_eq!(counts.other, 4);
        assert_eq!(counts.total(), 10);
    }

    #[test]
    fn work_item_uses_column_name_for_selector() {
        let item = WorkItem {
            id: WorkItemId::new(10),
            link: "https://example.test/a".into(),
            css_selector: "#listing".into(),
            priority: 5,
            attempts: 1,
            source_table: None,
            source_id: Some(7),
            run_interval_minutes: None,
        };

        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["the_css"], "#listing");
        assert_eq!(json["id"], 10);
    }

    #[test]
    fn outcome_maps_to_row_fields() {
        let done = JobOutcome::Done {
            output_path: Some("/out/1.json".into()),
        };
        assert_eq!(done.status(), WorkStatus::Done);
        assert_eq!(done.output_path(), Some("/out/1.json"));
        assert_eq!(done.error_message(), None);

        let requeue = JobOutcome::Requeue {
            reason: "Parser returned 0 records.".into(),
        };
        assert_eq!(requeue.status(), WorkStatus::Queued);
        assert_eq!(requeue.error_message(), Some("Parser returned 0 records."));
    }
}
