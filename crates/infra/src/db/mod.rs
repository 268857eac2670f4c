//! Queue storage boundary.
//!
//! The claimer and maintenance operations speak to storage through
//! [`QueueConnection`]; the Postgres adapter backs production and the
//! in-memory adapter backs tests and local runs.

pub mod connection;
pub mod error;
pub mod in_memory;
pub mod postgres;

pub use connection::QueueConnection;
pub use error::{StoreError, StoreResult};
pub use in_memory::{FaultPoint, InMemoryConnection, InMemoryQueue, TxStats, WorkRecord};
pub use postgres::{PgQueueConnection, connect_pool};
