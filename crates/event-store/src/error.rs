use thiserror::Error;

use crate::{AggregateId, Sequence};

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// A concurrency conflict occurred when appending events.
    /// The expected sequence did not match the aggregate's current head.
    #[error(
        "Concurrency conflict for aggregate {aggregate_id}: expected sequence {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        aggregate_id: AggregateId,
        expected: Sequence,
        actual: Sequence,
    },

    /// The batch handed to `append` is malformed.
    #[error("Invalid append: {0}")]
    Validation(String),

    /// The backend could not durably store or read events.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// Returns true when retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Database(_))
    }
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
