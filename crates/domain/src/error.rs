//! Domain error types.

use event_store::EventStoreError;
use projections::ProjectionError;
use thiserror::Error;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// The aggregate refused the command.
    #[error("Command rejected: {0}")]
    Rejected(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    /// True for an optimistic-concurrency conflict on append; the caller may
    /// reload and retry the command.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::EventStore(EventStoreError::ConcurrencyConflict { .. })
        )
    }
}

/// Errors surfaced by the command pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Loading, deciding or appending failed; nothing was written.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The events were appended but driving the projector failed.
    #[error("Projection error: {0}")]
    Projection(#[from] ProjectionError),
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
