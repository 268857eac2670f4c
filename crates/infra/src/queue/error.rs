//! Errors surfaced by the claimer and the maintenance operations.

use thiserror::Error;

use crate::db::StoreError;

/// Claim failure after local handling (rollback, logging, alerting) is done.
///
/// Callers polling on a schedule should treat either kind as "try again next
/// tick"; `ExhaustedRetries` repeating means the queue layer is unhealthy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimError {
    /// Every attempt hit lock contention.
    #[error("claim failed after {attempts} attempts: {source}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// A non-transient failure; no further attempts were made.
    #[error("claim aborted on attempt {attempt}: {source}")]
    Fatal {
        attempt: u32,
        #[source]
        source: StoreError,
    },
}

impl ClaimError {
    /// The storage error that ended the claim.
    pub fn store_error(&self) -> &StoreError {
        match self {
            ClaimError::ExhaustedRetries { source, .. } | ClaimError::Fatal { source, .. } => source,
        }
    }

    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            ClaimError::ExhaustedRetries { attempts, .. } => *attempts,
            ClaimError::Fatal { attempt, .. } => *attempt,
        }
    }
}

/// Maintenance operation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MaintenanceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{operation} failed after {attempts} attempts: {source}")]
    ExhaustedRetries {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: StoreError,
    },
}
