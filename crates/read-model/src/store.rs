use std::sync::Arc;

use async_trait::async_trait;
use common::ReadModelId;

use crate::{FindQuery, ModelUpdate, Page, ReadModel, Result, Version};

/// Versioned persistence for read models.
///
/// Every write is a compare-and-swap on the model version, so two writers
/// racing on the same model can never both succeed.
#[async_trait]
pub trait ReadModelStore: Send + Sync {
    async fn get(&self, id: &ReadModelId) -> Result<Option<ReadModel>>;

    /// Creates or replaces a model.
    ///
    /// `expected` must equal the stored version, or be `Version::initial()`
    /// when the model must not exist yet. On success the stored version is
    /// `expected + 1`; otherwise `ConcurrencyConflict` is returned and
    /// nothing changes.
    async fn upsert(
        &self,
        id: &ReadModelId,
        expected: Version,
        update: ModelUpdate,
    ) -> Result<ReadModel>;

    /// Hard-deletes a model.
    ///
    /// With `Some(expected)` the stored version must match. Deleting a
    /// missing model without an expectation succeeds.
    async fn delete(&self, id: &ReadModelId, expected: Option<Version>) -> Result<()>;

    /// Runs a filtered, sorted, paginated search.
    async fn find(&self, query: &FindQuery) -> Result<Page>;
}

#[async_trait]
impl<T: ReadModelStore + ?Sized> ReadModelStore for Arc<T> {
    async fn get(&self, id: &ReadModelId) -> Result<Option<ReadModel>> {
        (**self).get(id).await
    }

    async fn upsert(
        &self,
        id: &ReadModelId,
        expected: Version,
        update: ModelUpdate,
    ) -> Result<ReadModel> {
        (**self).upsert(id, expected, update).await
    }

    async fn delete(&self, id: &ReadModelId, expected: Option<Version>) -> Result<()> {
        (**self).delete(id, expected).await
    }

    async fn find(&self, query: &FindQuery) -> Result<Page> {
        (**self).find(query).await
    }
}
