//! Identifier types shared across the event store, read models and projector.

pub mod ids;

pub use ids::{AggregateId, ProjectionId, ReadModelId};
