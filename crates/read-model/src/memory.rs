use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use common::ReadModelId;
use tokio::sync::RwLock;

use crate::{
    FindQuery, ModelUpdate, Page, ReadModel, ReadModelError, ReadModelStore, Result, Version,
};

/// In-memory read-model store.
///
/// Offers the same compare-and-swap guarantees as the PostgreSQL store.
#[derive(Clone, Default)]
pub struct InMemoryReadModelStore {
    models: Arc<RwLock<HashMap<ReadModelId, ReadModel>>>,
    failing_writes: Arc<AtomicUsize>,
}

impl InMemoryReadModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.models.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.models.read().await.is_empty()
    }

    /// Makes the next `count` writes fail with a transient storage error.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> Result<()> {
        let took = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(ReadModelError::Storage("injected write failure".to_string()));
        }
        Ok(())
    }
}

fn conflict(id: &ReadModelId, expected: Version, actual: Option<Version>) -> ReadModelError {
    metrics::counter!("read_model_conflicts_total").increment(1);
    ReadModelError::ConcurrencyConflict {
        id: id.clone(),
        expected,
        actual,
    }
}

#[async_trait]
impl ReadModelStore for InMemoryReadModelStore {
    async fn get(&self, id: &ReadModelId) -> Result<Option<ReadModel>> {
        Ok(self.models.read().await.get(id).cloned())
    }

    async fn upsert(
        &self,
        id: &ReadModelId,
        expected: Version,
        update: ModelUpdate,
    ) -> Result<ReadModel> {
        self.injected_failure()?;

        let mut models = self.models.write().await;
        let now = Utc::now();
        let actual = models.get(id).map(|m| m.version);

        let model = match models.get_mut(id) {
            None if expected == Version::initial() => {
                let model = ReadModel {
                    id: id.clone(),
                    model_type: update.model_type,
                    version: Version::first(),
                    data: update.data,
                    metadata: update.metadata,
                    created_at: now,
                    updated_at: now,
                };
                models.insert(id.clone(), model.clone());
                model
            }
            Some(existing) if existing.version == expected => {
                existing.model_type = update.model_type;
                existing.data = update.data;
                existing.metadata = update.metadata;
                existing.version = expected.next();
                existing.updated_at = now;
                existing.clone()
            }
            _ => return Err(conflict(id, expected, actual)),
        };

        Ok(model)
    }

    async fn delete(&self, id: &ReadModelId, expected: Option<Version>) -> Result<()> {
        self.injected_failure()?;

        let mut models = self.models.write().await;
        let actual = models.get(id).map(|m| m.version);

        match (expected, actual) {
            (Some(expected), actual) if actual != Some(expected) => {
                Err(conflict(id, expected, actual))
            }
            _ => {
                models.remove(id);
                Ok(())
            }
        }
    }

    async fn find(&self, query: &FindQuery) -> Result<Page> {
        query.validate()?;

        let models = self.models.read().await;
        let mut matching: Vec<&ReadModel> = models
            .values()
            .filter(|m| query.filter.matches(m))
            .collect();
        matching.sort_by(|a, b| query.compare(a, b));

        let total = query.include_total.then_some(matching.len() as u64);
        let items = matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        Ok(Page { items, total })
    }
}
