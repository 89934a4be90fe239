use common::ReadModelId;
use event_store::EventEnvelope;
use read_model::ReadModel;

use crate::Result;
use crate::projection::{Projection, ProjectionOutcome};

type TargetFn = Box<dyn Fn(&EventEnvelope) -> ReadModelId + Send + Sync>;

/// Adapts a closure into a [`Projection`].
pub struct FnProjection<F> {
    apply: F,
    target: Option<TargetFn>,
}

impl<F> FnProjection<F>
where
    F: Fn(Option<&ReadModel>, &EventEnvelope) -> Result<ProjectionOutcome> + Send + Sync,
{
    pub fn new(apply: F) -> Self {
        Self {
            apply,
            target: None,
        }
    }

    /// Routes events to a model other than their aggregate's.
    pub fn with_target(
        mut self,
        target: impl Fn(&EventEnvelope) -> ReadModelId + Send + Sync + 'static,
    ) -> Self {
        self.target = Some(Box::new(target));
        self
    }
}

impl<F> Projection for FnProjection<F>
where
    F: Fn(Option<&ReadModel>, &EventEnvelope) -> Result<ProjectionOutcome> + Send + Sync,
{
    fn apply(
        &self,
        current: Option<&ReadModel>,
        event: &EventEnvelope,
    ) -> Result<ProjectionOutcome> {
        (self.apply)(current, event)
    }

    fn target_id(&self, event: &EventEnvelope) -> ReadModelId {
        match &self.target {
            Some(target) => target(event),
            None => ReadModelId::from(&event.aggregate_id),
        }
    }
}
