//! `workclaim-core` — queue domain building blocks.
//!
//! This crate contains **pure domain** types for the shared work queue (no
//! storage or runtime concerns).

pub mod error;
pub mod id;
pub mod queue;
pub mod work_item;

pub use error::{DomainError, DomainResult};
pub use id::WorkItemId;
pub use queue::{ClaimBatchSize, TableName};
pub use work_item::{JobOutcome, StatusCounts, WorkItem, WorkStatus};
