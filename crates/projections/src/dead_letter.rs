//! Parking lot for events a projection could not apply.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateId, ProjectionId};
use event_store::EventEnvelope;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{FailureKind, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub projection_id: ProjectionId,
    pub event: EventEnvelope,
    pub error: String,
    pub kind: FailureKind,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        projection_id: ProjectionId,
        event: EventEnvelope,
        error: impl Into<String>,
        kind: FailureKind,
        attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            projection_id,
            event,
            error: error.into(),
            kind,
            attempts,
            dead_lettered_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn record(&self, letter: DeadLetter) -> Result<()>;

    /// Dead letters in the order they were recorded, optionally for one
    /// projection only.
    async fn list(&self, projection_id: Option<&ProjectionId>) -> Result<Vec<DeadLetter>>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetter>>;

    /// Removes and returns a dead letter.
    async fn take(&self, id: Uuid) -> Result<Option<DeadLetter>>;

    /// Whether a dead letter holds `aggregate_id` back for `projection_id`.
    async fn is_blocking(
        &self,
        projection_id: &ProjectionId,
        aggregate_id: &AggregateId,
    ) -> Result<bool>;

    async fn count(&self, projection_id: &ProjectionId) -> Result<usize>;
}

#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    letters: RwLock<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn record(&self, letter: DeadLetter) -> Result<()> {
        self.letters.write().await.push(letter);
        Ok(())
    }

    async fn list(&self, projection_id: Option<&ProjectionId>) -> Result<Vec<DeadLetter>> {
        Ok(self
            .letters
            .read()
            .await
            .iter()
            .filter(|letter| projection_id.is_none_or(|pid| &letter.projection_id == pid))
            .cloned()
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetter>> {
        Ok(self
            .letters
            .read()
            .await
            .iter()
            .find(|letter| letter.id == id)
            .cloned())
    }

    async fn take(&self, id: Uuid) -> Result<Option<DeadLetter>> {
        let mut letters = self.letters.write().await;
        Ok(letters
            .iter()
            .position(|letter| letter.id == id)
            .map(|idx| letters.remove(idx)))
    }

    async fn is_blocking(
        &self,
        projection_id: &ProjectionId,
        aggregate_id: &AggregateId,
    ) -> Result<bool> {
        Ok(self.letters.read().await.iter().any(|letter| {
            &letter.projection_id == projection_id && &letter.event.aggregate_id == aggregate_id
        }))
    }

    async fn count(&self, projection_id: &ProjectionId) -> Result<usize> {
        Ok(self
            .letters
            .read()
            .await
            .iter()
            .filter(|letter| &letter.projection_id == projection_id)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_store::Sequence;

    fn letter(pid: &str, agg: &str) -> DeadLetter {
        let event = EventEnvelope::builder()
            .event_type("Renamed")
            .aggregate_id(agg)
            .aggregate_type("Customer")
            .sequence(Sequence::first())
            .payload_raw(serde_json::json!({}))
            .build();
        DeadLetter::new(pid.into(), event, "boom", FailureKind::Permanent, 1)
    }

    #[tokio::test]
    async fn blocking_is_scoped_to_projection_and_aggregate() {
        let store = InMemoryDeadLetterStore::new();
        store.record(letter("p", "X")).await.unwrap();

        assert!(store.is_blocking(&"p".into(), &"X".into()).await.unwrap());
        assert!(!store.is_blocking(&"p".into(), &"Y".into()).await.unwrap());
        assert!(!store.is_blocking(&"q".into(), &"X".into()).await.unwrap());
    }

    #[tokio::test]
    async fn take_removes_the_letter() {
        let store = InMemoryDeadLetterStore::new();
        let first = letter("p", "X");
        let id = first.id;
        store.record(first).await.unwrap();
        store.record(letter("q", "X")).await.unwrap();

        assert_eq!(store.list(None).await.unwrap().len(), 2);
        assert_eq!(store.count(&"p".into()).await.unwrap(), 1);

        let taken = store.take(id).await.unwrap().unwrap();
        assert_eq!(taken.projection_id, ProjectionId::from("p"));
        assert!(store.get(id).await.unwrap().is_none());
        assert!(store.take(id).await.unwrap().is_none());
        assert!(store.list(Some(&"p".into())).await.unwrap().is_empty());
    }
}
