//! Projection error types.

use common::ProjectionId;
use read_model::ReadModelError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// How the projector reacts to a failed application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The read model moved under us; re-read and recompute.
    Conflict,
    /// Worth retrying with backoff.
    Transient,
    /// Retrying cannot help; dead-letter immediately.
    Permanent,
}

/// Errors that can occur during projection processing.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// The projection refused the event (bad payload, missing field, ...).
    #[error("Event rejected: {0}")]
    Rejected(String),

    /// Failed to deserialize an event payload.
    #[error("Event deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] event_store::EventStoreError),

    #[error("Read model error: {0}")]
    ReadModel(#[from] ReadModelError),

    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("Dead-letter store error: {0}")]
    DeadLetter(String),

    #[error("Projection {0} is already registered")]
    DuplicateProjection(ProjectionId),

    #[error("Unknown projection {0}")]
    UnknownProjection(ProjectionId),

    #[error("Invalid projection config: {0}")]
    InvalidConfig(String),

    #[error("Unknown dead letter {0}")]
    UnknownDeadLetter(Uuid),

    /// The projector has no running workers to hand events to.
    #[error("Projector is not running")]
    NotRunning,
}

impl ProjectionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::ReadModel(e) if e.is_conflict() => FailureKind::Conflict,
            Self::ReadModel(e) if e.is_transient() => FailureKind::Transient,
            Self::EventStore(e) if e.is_transient() => FailureKind::Transient,
            Self::Checkpoint(_) | Self::DeadLetter(_) => FailureKind::Transient,
            _ => FailureKind::Permanent,
        }
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
