//! Queue claiming and housekeeping.
//!
//! ## Components
//!
//! - `QueueClaimer`: claims batches of queued rows under a per-table claim
//!   lock, retrying lock contention with backoff
//! - `QueueMaintenance`: status counts, stale-row recovery, interval
//!   re-queueing and outcome recording
//! - `RetryPolicy`: attempt budget and backoff shared by both

pub mod claimer;
pub mod error;
pub mod maintenance;
pub mod retry;

pub use claimer::{ClaimSettings, QueueClaimer};
pub use error::{ClaimError, MaintenanceError};
pub use maintenance::QueueMaintenance;
pub use retry::RetryPolicy;
