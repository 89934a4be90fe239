use std::sync::Arc;

use common::ReadModelId;
use serde::{Deserialize, Serialize};

use crate::{Filter, FindQuery, Page, ReadModel, ReadModelStore, Result, SortKey};

/// Query engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Upper bound applied to every page size, including unbounded requests.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

fn default_max_page_size() -> usize {
    1_000
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_page_size: default_max_page_size(),
        }
    }
}

/// Read-side entry point for lookups and searches.
///
/// Lookups go through whatever store it is given, normally a
/// [`CachedReadModelStore`](crate::cache::CachedReadModelStore).
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<dyn ReadModelStore>,
    config: QueryConfig,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn ReadModelStore>, config: QueryConfig) -> Self {
        Self { store, config }
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_by_id(&self, id: &ReadModelId) -> Result<Option<ReadModel>> {
        self.store.get(id).await
    }

    /// Searches read models.
    ///
    /// Results are totally ordered: `id` ascending is appended as the last
    /// sort key unless the caller already sorts on `id`, so consecutive
    /// pages never overlap or skip models.
    #[tracing::instrument(skip(self, filter, sort))]
    pub async fn find(
        &self,
        filter: Filter,
        sort: Vec<SortKey>,
        limit: Option<usize>,
        offset: usize,
        include_total: bool,
    ) -> Result<Page> {
        let query = FindQuery {
            filter,
            sort,
            limit,
            offset,
            include_total,
        };
        self.search(query).await
    }

    /// Like [`find`](Self::find) with a prebuilt query.
    pub async fn search(&self, mut query: FindQuery) -> Result<Page> {
        query.validate()?;

        if !query.sort.iter().any(|key| key.field == "id") {
            query.sort.push(SortKey::asc("id"));
        }
        let cap = self.config.max_page_size;
        query.limit = Some(query.limit.map_or(cap, |limit| limit.min(cap)));

        self.store.find(&query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Condition, InMemoryReadModelStore, ModelUpdate, Operator, ReadModelError, Version};
    use serde_json::json;

    async fn seeded() -> QueryEngine {
        let store = InMemoryReadModelStore::new();
        for (key, tier) in [("c", "gold"), ("a", "gold"), ("d", "silver"), ("b", "gold")] {
            store
                .upsert(
                    &ReadModelId::from(key),
                    Version::initial(),
                    ModelUpdate::new(
                        "customer",
                        json!({ "tier": tier }).as_object().cloned().unwrap(),
                    ),
                )
                .await
                .unwrap();
        }
        QueryEngine::new(Arc::new(store), QueryConfig { max_page_size: 2 })
    }

    fn ids(page: &Page) -> Vec<&str> {
        page.items.iter().map(|m| m.id.as_str()).collect()
    }

    #[tokio::test]
    async fn ties_are_broken_by_id() {
        let engine = seeded().await;
        let filter = Filter::new().condition(Condition::eq("tier", "gold"));

        let first = engine
            .find(filter.clone(), vec![SortKey::asc("tier")], Some(2), 0, true)
            .await
            .unwrap();
        let second = engine
            .find(filter, vec![SortKey::asc("tier")], Some(2), 2, true)
            .await
            .unwrap();

        assert_eq!(ids(&first), vec!["a", "b"]);
        assert_eq!(ids(&second), vec!["c"]);
        assert_eq!(first.total, Some(3));
    }

    #[tokio::test]
    async fn limit_is_capped() {
        let engine = seeded().await;
        let page = engine
            .find(Filter::new(), Vec::new(), None, 0, false)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total, None);
    }

    #[tokio::test]
    async fn invalid_query_is_rejected() {
        let engine = seeded().await;
        let filter = Filter::new().condition(Condition::new("tier", Operator::In, "gold"));
        let result = engine.find(filter, Vec::new(), None, 0, false).await;
        assert!(matches!(result, Err(ReadModelError::InvalidQuery(_))));
    }

    #[tokio::test]
    async fn get_by_id_returns_none_for_missing() {
        let engine = seeded().await;
        assert!(engine.get_by_id(&ReadModelId::from("a")).await.unwrap().is_some());
        assert!(engine.get_by_id(&ReadModelId::from("zz")).await.unwrap().is_none());
    }
}
