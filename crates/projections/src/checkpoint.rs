//! Per-projection, per-aggregate progress tracking.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateId, ProjectionId};
use event_store::Sequence;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::Result;

/// Progress of one projection.
///
/// `positions` holds, per aggregate, the highest sequence the projection has
/// passed over (applied, skipped, or dead-lettered in relaxed mode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectorCheckpoint {
    pub projection_id: ProjectionId,
    pub positions: HashMap<AggregateId, Sequence>,
    pub events_applied: u64,
    pub updated_at: DateTime<Utc>,
}

impl ProjectorCheckpoint {
    pub fn new(projection_id: ProjectionId) -> Self {
        Self {
            projection_id,
            positions: HashMap::new(),
            events_applied: 0,
            updated_at: Utc::now(),
        }
    }

    /// Last sequence passed for `aggregate_id`; `Sequence::initial()` if none.
    pub fn position(&self, aggregate_id: &AggregateId) -> Sequence {
        self.positions
            .get(aggregate_id)
            .copied()
            .unwrap_or_else(Sequence::initial)
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, projection_id: &ProjectionId) -> Result<Option<ProjectorCheckpoint>>;

    /// Creates an empty checkpoint if none exists.
    async fn ensure(&self, projection_id: &ProjectionId) -> Result<()>;

    async fn position(
        &self,
        projection_id: &ProjectionId,
        aggregate_id: &AggregateId,
    ) -> Result<Sequence>;

    /// Moves the position forward to `sequence`.
    ///
    /// Never moves backwards. `applied` counts the event in
    /// `events_applied`. Returns the resulting position.
    async fn advance(
        &self,
        projection_id: &ProjectionId,
        aggregate_id: &AggregateId,
        sequence: Sequence,
        applied: bool,
    ) -> Result<Sequence>;
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<ProjectionId, ProjectorCheckpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, projection_id: &ProjectionId) -> Result<Option<ProjectorCheckpoint>> {
        Ok(self.checkpoints.read().await.get(projection_id).cloned())
    }

    async fn ensure(&self, projection_id: &ProjectionId) -> Result<()> {
        self.checkpoints
            .write()
            .await
            .entry(projection_id.clone())
            .or_insert_with(|| ProjectorCheckpoint::new(projection_id.clone()));
        Ok(())
    }

    async fn position(
        &self,
        projection_id: &ProjectionId,
        aggregate_id: &AggregateId,
    ) -> Result<Sequence> {
        Ok(self
            .checkpoints
            .read()
            .await
            .get(projection_id)
            .map(|checkpoint| checkpoint.position(aggregate_id))
            .unwrap_or_else(Sequence::initial))
    }

    async fn advance(
        &self,
        projection_id: &ProjectionId,
        aggregate_id: &AggregateId,
        sequence: Sequence,
        applied: bool,
    ) -> Result<Sequence> {
        let mut checkpoints = self.checkpoints.write().await;
        let checkpoint = checkpoints
            .entry(projection_id.clone())
            .or_insert_with(|| ProjectorCheckpoint::new(projection_id.clone()));

        let position = checkpoint
            .positions
            .entry(aggregate_id.clone())
            .or_insert_with(Sequence::initial);
        if sequence > *position {
            *position = sequence;
            if applied {
                checkpoint.events_applied += 1;
            }
            checkpoint.updated_at = Utc::now();
        }
        Ok(*position)
    }
}
