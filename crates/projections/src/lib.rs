//! Projections for the CQRS query side.
//!
//! - [`Projection`]: pure transformation of an event into a read-model change
//! - [`ProjectionRegistry`]: event type to projection dispatch table
//! - [`Projector`]: applies events idempotently and in per-aggregate order,
//!   with retries, dead letters and checkpoints
//! - [`views`]: built-in and declarative projections

pub mod checkpoint;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod projection;
pub mod projector;
pub mod registry;
pub mod retry;
pub mod views;

pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore, ProjectorCheckpoint};
pub use config::ProjectorConfig;
pub use dead_letter::{DeadLetter, DeadLetterStore, InMemoryDeadLetterStore};
pub use error::{FailureKind, ProjectionError, Result};
pub use projection::{
    OrderingMode, OverflowPolicy, Projection, ProjectionConfig, ProjectionDefinition,
    ProjectionOutcome,
};
pub use projector::{CheckpointStatus, Projector, ProjectorBuilder, UnitReport, UnitState};
pub use registry::{ProjectionRegistry, RegisteredProjection};
pub use retry::RetryPolicy;
pub use views::{DeleteModel, FnProjection, MergeFields, ViewKind, ViewSpec};
