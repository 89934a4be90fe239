//! Core projection trait and projection definitions.

use common::{ProjectionId, ReadModelId};
use event_store::EventEnvelope;
use read_model::{Document, ReadModel};
use serde::{Deserialize, Serialize};

use crate::Result;

/// What a projection wants done to its target read model.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionOutcome {
    /// Replace the model data (creating the model if needed).
    Upsert(Document),
    /// Remove the model.
    Delete,
    /// Leave the model untouched.
    NoOp,
}

/// A pure transformation of an event into a read-model change.
///
/// Projections hold no read-model state and perform no I/O: the projector
/// loads the current model, calls [`apply`](Projection::apply), and persists
/// the outcome under optimistic concurrency. `apply` may therefore be called
/// more than once for the same event (after a version conflict, or on
/// redelivery) and must return the same outcome for the same inputs.
pub trait Projection: Send + Sync {
    fn apply(&self, current: Option<&ReadModel>, event: &EventEnvelope)
    -> Result<ProjectionOutcome>;

    /// The read model this event updates. Defaults to the aggregate id.
    fn target_id(&self, event: &EventEnvelope) -> ReadModelId {
        ReadModelId::from(&event.aggregate_id)
    }
}

/// Ordering guarantee of a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingMode {
    /// A dead-lettered event halts the projection for that aggregate until
    /// it is replayed.
    #[default]
    Strict,
    /// A dead-lettered event is passed over; later events keep flowing.
    Relaxed,
}

/// What happens when a projection cannot keep up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum OverflowPolicy {
    /// Producers wait for space (no event is ever lost).
    #[default]
    Block,
    /// Best effort: the projection gets its own ring of `capacity` events
    /// and the oldest queued event is dropped when it is full.
    DropOldest { capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProjectionConfig {
    #[serde(default)]
    pub ordering: OrderingMode,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    /// Overrides the projector's retry budget for this projection.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl ProjectionConfig {
    pub fn relaxed() -> Self {
        Self {
            ordering: OrderingMode::Relaxed,
            ..Self::default()
        }
    }

    pub fn best_effort(capacity: usize) -> Self {
        Self {
            ordering: OrderingMode::Relaxed,
            overflow: OverflowPolicy::DropOldest { capacity },
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn is_best_effort(&self) -> bool {
        matches!(self.overflow, OverflowPolicy::DropOldest { .. })
    }
}

/// Registry entry describing a projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionDefinition {
    pub id: ProjectionId,
    pub name: String,
    pub source_event_type: String,
    pub target_model_type: String,
    pub active: bool,
    #[serde(default)]
    pub config: ProjectionConfig,
}

impl ProjectionDefinition {
    pub fn new(
        id: impl Into<ProjectionId>,
        source_event_type: impl Into<String>,
        target_model_type: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            source_event_type: source_event_type.into(),
            target_model_type: target_model_type.into(),
            active: true,
            config: ProjectionConfig::default(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_config(mut self, config: ProjectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}
