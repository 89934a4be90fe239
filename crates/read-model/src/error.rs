use common::ReadModelId;
use thiserror::Error;

use crate::Version;

/// Errors returned by read-model stores and the query engine.
#[derive(Debug, Error)]
pub enum ReadModelError {
    /// The stored version did not match the expected version.
    /// `actual` is `None` when the model does not exist.
    #[error("Concurrency conflict for read model {id}: expected version {expected}, found {actual:?}")]
    ConcurrencyConflict {
        id: ReadModelId,
        expected: Version,
        actual: Option<Version>,
    },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The backend could not read or persist the model.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ReadModelError {
    /// Returns true when retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Database(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Errors raised by a cache tier. Never fatal to a read or write.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Cache entry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReadModelError>;
