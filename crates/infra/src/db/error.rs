//! Storage error model shared by every queue backend.

use thiserror::Error;

/// Result type for queue connection operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Queue storage error.
///
/// Only [`StoreError::Contention`] is worth retrying; the other kinds mean the
/// connection or the statement itself is broken and another attempt would
/// fail the same way.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Lock wait timeout, deadlock or serialization failure.
    #[error("lock contention: {0}")]
    Contention(String),

    /// The connection is unusable (I/O, TLS, pool exhausted or closed).
    #[error("connection failure: {0}")]
    Connection(String),

    /// The statement was rejected (missing table/column, syntax, constraint).
    #[error("query failed: {0}")]
    Query(String),

    /// A returned row could not be mapped onto the queue model.
    #[error("row decode failed: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn contention(msg: impl Into<String>) -> Self {
        Self::Contention(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Whether the failed operation may succeed if attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Contention(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Contention(_) => "contention",
            StoreError::Connection(_) => "connection",
            StoreError::Query(_) => "query",
            StoreError::Decode(_) => "decode",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_contention_is_transient() {
        assert!(StoreError::contention("lock timeout").is_transient());
        assert!(!StoreError::connection("reset by peer").is_transient());
        assert!(!StoreError::query("relation does not exist").is_transient());
        assert!(!StoreError::decode("bad column").is_transient());
    }
}
