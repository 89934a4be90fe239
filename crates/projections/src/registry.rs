//! String-keyed projection registry.

use std::collections::HashMap;
use std::sync::Arc;

use common::ProjectionId;
use parking_lot::RwLock;

use crate::projection::{OrderingMode, OverflowPolicy, Projection, ProjectionDefinition};
use crate::{ProjectionError, Result};

/// A projection together with its registry definition.
#[derive(Clone)]
pub struct RegisteredProjection {
    pub definition: ProjectionDefinition,
    pub projection: Arc<dyn Projection>,
}

impl RegisteredProjection {
    pub fn id(&self) -> &ProjectionId {
        &self.definition.id
    }
}

impl std::fmt::Debug for RegisteredProjection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredProjection")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryState {
    /// Registration order.
    entries: Vec<RegisteredProjection>,
    by_id: HashMap<ProjectionId, usize>,
    by_event_type: HashMap<String, Vec<usize>>,
}

/// Maps event types to the projections that consume them.
///
/// Dispatch order is registration order. Definitions are never removed,
/// only deactivated.
#[derive(Default)]
pub struct ProjectionRegistry {
    state: RwLock<RegistryState>,
}

impl ProjectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a projection. Fails on a duplicate id or an invalid
    /// configuration.
    pub fn register(
        &self,
        definition: ProjectionDefinition,
        projection: Arc<dyn Projection>,
    ) -> Result<()> {
        validate(&definition)?;

        let mut state = self.state.write();
        if state.by_id.contains_key(&definition.id) {
            return Err(ProjectionError::DuplicateProjection(definition.id));
        }

        let idx = state.entries.len();
        state.by_id.insert(definition.id.clone(), idx);
        state
            .by_event_type
            .entry(definition.source_event_type.clone())
            .or_default()
            .push(idx);
        tracing::info!(
            projection = %definition.id,
            event_type = %definition.source_event_type,
            "Registered projection"
        );
        state.entries.push(RegisteredProjection {
            definition,
            projection,
        });
        Ok(())
    }

    /// Resumes dispatching to a deactivated projection.
    pub fn activate(&self, id: &ProjectionId) -> Result<()> {
        self.set_active(id, true)
    }

    /// Stops dispatching to a projection. Its checkpoint is kept, so it is
    /// filled from there once activated again.
    pub fn deactivate(&self, id: &ProjectionId) -> Result<()> {
        self.set_active(id, false)
    }

    pub fn is_active(&self, id: &ProjectionId) -> bool {
        let state = self.state.read();
        state
            .by_id
            .get(id)
            .is_some_and(|&idx| state.entries[idx].definition.active)
    }

    fn set_active(&self, id: &ProjectionId, active: bool) -> Result<()> {
        let mut state = self.state.write();
        let idx = *state
            .by_id
            .get(id)
            .ok_or_else(|| ProjectionError::UnknownProjection(id.clone()))?;
        state.entries[idx].definition.active = active;
        Ok(())
    }

    /// Active projections consuming `event_type`, in registration order.
    pub fn projections_for(&self, event_type: &str) -> Vec<RegisteredProjection> {
        let state = self.state.read();
        state
            .by_event_type
            .get(event_type)
            .map(|indexes| {
                indexes
                    .iter()
                    .map(|&idx| &state.entries[idx])
                    .filter(|entry| entry.definition.active)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Looks up a projection, active or not.
    pub fn get(&self, id: &ProjectionId) -> Option<RegisteredProjection> {
        let state = self.state.read();
        state.by_id.get(id).map(|&idx| state.entries[idx].clone())
    }

    /// All definitions in registration order.
    pub fn list(&self) -> Vec<ProjectionDefinition> {
        self.state
            .read()
            .entries
            .iter()
            .map(|entry| entry.definition.clone())
            .collect()
    }

    /// Event types with at least one registered projection, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.state.read().by_event_type.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate(definition: &ProjectionDefinition) -> Result<()> {
    if definition.source_event_type.is_empty() {
        return Err(ProjectionError::InvalidConfig(format!(
            "projection {} has no source event type",
            definition.id
        )));
    }
    if let OverflowPolicy::DropOldest { capacity } = definition.config.overflow {
        if capacity == 0 {
            return Err(ProjectionError::InvalidConfig(format!(
                "projection {} has a zero-capacity ring",
                definition.id
            )));
        }
        if definition.config.ordering == OrderingMode::Strict {
            return Err(ProjectionError::InvalidConfig(format!(
                "projection {} drops events and cannot use strict ordering",
                definition.id
            )));
        }
    }
    if definition.config.max_attempts == Some(0) {
        return Err(ProjectionError::InvalidConfig(format!(
            "projection {} needs at least one attempt",
            definition.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{ProjectionConfig, ProjectionOutcome};
    use event_store::EventEnvelope;
    use read_model::ReadModel;

    struct Noop;

    impl Projection for Noop {
        fn apply(&self, _: Option<&ReadModel>, _: &EventEnvelope) -> Result<ProjectionOutcome> {
            Ok(ProjectionOutcome::NoOp)
        }
    }

    fn def(id: &str, event_type: &str) -> ProjectionDefinition {
        ProjectionDefinition::new(id, event_type, "customer")
    }

    #[test]
    fn dispatch_follows_registration_order() {
        let registry = ProjectionRegistry::new();
        registry.register(def("b", "Created"), Arc::new(Noop)).unwrap();
        registry.register(def("a", "Created"), Arc::new(Noop)).unwrap();
        registry.register(def("c", "Renamed"), Arc::new(Noop)).unwrap();

        let ids: Vec<_> = registry
            .projections_for("Created")
            .iter()
            .map(|p| p.id().to_string())
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(registry.projections_for("Deleted").is_empty());
        assert_eq!(registry.event_types(), vec!["Created", "Renamed"]);
    }

    #[test]
    fn rejects_duplicates() {
        let registry = ProjectionRegistry::new();
        registry.register(def("a", "Created"), Arc::new(Noop)).unwrap();
        let result = registry.register(def("a", "Renamed"), Arc::new(Noop));
        assert!(matches!(
            result,
            Err(ProjectionError::DuplicateProjection(_))
        ));
    }

    #[test]
    fn rejects_strict_drop_oldest() {
        let registry = ProjectionRegistry::new();
        let mut config = ProjectionConfig::best_effort(4);
        config.ordering = OrderingMode::Strict;

        let result = registry.register(def("a", "Created").with_config(config), Arc::new(Noop));
        assert!(matches!(result, Err(ProjectionError::InvalidConfig(_))));
    }

    #[test]
    fn deactivated_projections_are_not_dispatched() {
        let registry = ProjectionRegistry::new();
        registry.register(def("a", "Created"), Arc::new(Noop)).unwrap();

        registry.deactivate(&"a".into()).unwrap();
        assert!(registry.projections_for("Created").is_empty());
        assert!(!registry.get(&"a".into()).unwrap().definition.active);
        assert!(!registry.is_active(&"a".into()));

        registry.activate(&"a".into()).unwrap();
        assert_eq!(registry.projections_for("Created").len(), 1);
        assert!(registry.is_active(&"a".into()));
        assert!(!registry.is_active(&"zz".into()));

        assert!(matches!(
            registry.activate(&"zz".into()),
            Err(ProjectionError::UnknownProjection(_))
        ));
    }
}
