use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::ReadModelId;
use dashmap::{DashMap, DashSet};
use tracing::{debug, warn};

use super::{CacheConfig, CacheEntry, CacheTier, LocalCache};
use crate::{
    CacheError, FindQuery, ModelUpdate, Page, ReadModel, ReadModelStore, Result, Version,
};

/// Read-through, write-invalidate cache over a read-model store.
///
/// Reads try the local tier, then the distributed tier (when configured),
/// then the store. Every write evicts the key from all tiers before it
/// returns. A per-key generation counter keeps a read that raced a write
/// from caching what it read.
///
/// Tier failures never fail a call: the store is consulted instead. A key
/// whose distributed invalidation failed is marked suspect and bypasses the
/// cache until an invalidation for it succeeds.
#[derive(Clone)]
pub struct CachedReadModelStore {
    inner: Arc<dyn ReadModelStore>,
    local: LocalCache,
    distributed: Option<Arc<dyn CacheTier>>,
    config: CacheConfig,
    generations: Arc<DashMap<ReadModelId, u64>>,
    suspect: Arc<DashSet<ReadModelId>>,
}

impl CachedReadModelStore {
    /// Single-tier cache.
    pub fn new(inner: Arc<dyn ReadModelStore>, config: CacheConfig) -> Self {
        Self {
            local: LocalCache::new(config.local_capacity, config.ttl),
            inner,
            distributed: None,
            config,
            generations: Arc::new(DashMap::new()),
            suspect: Arc::new(DashSet::new()),
        }
    }

    /// Local tier in front of a shared distributed tier.
    pub fn with_distributed(
        inner: Arc<dyn ReadModelStore>,
        distributed: Arc<dyn CacheTier>,
        config: CacheConfig,
    ) -> Self {
        Self {
            distributed: Some(distributed),
            ..Self::new(inner, config)
        }
    }

    pub fn inner(&self) -> &Arc<dyn ReadModelStore> {
        &self.inner
    }

    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    pub fn is_suspect(&self, id: &ReadModelId) -> bool {
        self.suspect.contains(id)
    }

    fn generation(&self, id: &ReadModelId) -> u64 {
        self.generations.get(id).map(|g| *g).unwrap_or(0)
    }

    /// Evicts `id` from every tier.
    pub async fn invalidate(&self, id: &ReadModelId) {
        *self.generations.entry(id.clone()).or_insert(0) += 1;
        self.local.remove(id);

        let Some(ref distributed) = self.distributed else {
            return;
        };
        match distributed.invalidate(id).await {
            Ok(()) => {
                self.suspect.remove(id);
            }
            Err(e) => {
                fail_open("invalidate", id, &e);
                self.suspect.insert(id.clone());
            }
        }
    }

    /// Drops every cached entry. Suspect keys stay suspect if the
    /// distributed tier cannot be cleared.
    pub async fn clear(&self) {
        for mut generation in self.generations.iter_mut() {
            *generation += 1;
        }
        self.local.remove_all();

        if let Some(ref distributed) = self.distributed {
            match distributed.clear().await {
                Ok(()) => self.suspect.clear(),
                Err(e) => warn!(error = %e, "Failed to clear distributed cache"),
            }
        }
    }

    /// Retries a pending invalidation. Returns true if the key may use the cache.
    async fn settle_suspect(&self, id: &ReadModelId) -> bool {
        if !self.suspect.contains(id) {
            return true;
        }
        let Some(ref distributed) = self.distributed else {
            self.suspect.remove(id);
            return true;
        };
        match distributed.invalidate(id).await {
            Ok(()) => {
                self.suspect.remove(id);
                true
            }
            Err(e) => {
                fail_open("invalidate", id, &e);
                false
            }
        }
    }

    async fn lookup_local(&self, id: &ReadModelId) -> Option<ReadModel> {
        let entry = self.local.lookup(id).filter(CacheEntry::is_consistent)?;

        let Some(ref distributed) = self.distributed else {
            return Some(entry.value);
        };
        if !self.config.staleness_tolerance.is_zero()
            && entry.age(Utc::now()) < self.config.staleness_tolerance
        {
            return Some(entry.value);
        }

        match distributed.get(id).await {
            Ok(Some(shared)) if shared.version_stamp == entry.version_stamp => Some(entry.value),
            Ok(_) => {
                debug!(%id, "Local cache entry failed revalidation");
                self.local.remove(id);
                None
            }
            Err(e) => {
                fail_open("revalidate", id, &e);
                self.local.remove(id);
                None
            }
        }
    }

    async fn lookup_distributed(&self, id: &ReadModelId, generation: u64) -> Option<ReadModel> {
        let distributed = self.distributed.as_ref()?;
        match distributed.get(id).await {
            Ok(Some(entry)) if entry.is_consistent() => {
                if self.generation(id) == generation {
                    self.local.insert(entry.clone());
                }
                Some(entry.value)
            }
            Ok(_) => None,
            Err(e) => {
                fail_open("get", id, &e);
                None
            }
        }
    }

    async fn populate(&self, model: &ReadModel, generation: u64) {
        if self.generation(&model.id) != generation {
            return;
        }

        let entry = CacheEntry::new(model.clone(), self.config.ttl);
        self.local.insert(entry.clone());
        if let Some(ref distributed) = self.distributed
            && let Err(e) = distributed.put(entry).await
        {
            fail_open("put", &model.id, &e);
        }

        // A write may have landed while we were populating; undo our copy.
        if self.generation(&model.id) != generation {
            self.local.remove(&model.id);
            if let Some(ref distributed) = self.distributed
                && distributed.invalidate(&model.id).await.is_err()
            {
                self.suspect.insert(model.id.clone());
            }
        }
    }
}

fn fail_open(operation: &'static str, id: &ReadModelId, error: &CacheError) {
    metrics::counter!("read_model_cache_fail_open_total", "operation" => operation).increment(1);
    warn!(%id, operation, error = %error, "Cache tier failed, falling back to store");
}

#[async_trait]
impl ReadModelStore for CachedReadModelStore {
    async fn get(&self, id: &ReadModelId) -> Result<Option<ReadModel>> {
        if !self.settle_suspect(id).await {
            metrics::counter!("read_model_cache_misses_total").increment(1);
            return self.inner.get(id).await;
        }

        let generation = self.generation(id);

        if let Some(model) = self.lookup_local(id).await {
            metrics::counter!("read_model_cache_hits_total", "tier" => "local").increment(1);
            return Ok(Some(model));
        }
        if let Some(model) = self.lookup_distributed(id, generation).await {
            metrics::counter!("read_model_cache_hits_total", "tier" => "distributed").increment(1);
            return Ok(Some(model));
        }

        metrics::counter!("read_model_cache_misses_total").increment(1);
        let model = self.inner.get(id).await?;
        if let Some(ref model) = model {
            self.populate(model, generation).await;
        }
        Ok(model)
    }

    async fn upsert(
        &self,
        id: &ReadModelId,
        expected: Version,
        update: ModelUpdate,
    ) -> Result<ReadModel> {
        let result = self.inner.upsert(id, expected, update).await;
        // A conflict means some cached copy may be behind, evict it as well
        if result.is_ok() || result.as_ref().is_err_and(|e| e.is_conflict()) {
            self.invalidate(id).await;
        }
        result
    }

    async fn delete(&self, id: &ReadModelId, expected: Option<Version>) -> Result<()> {
        let result = self.inner.delete(id, expected).await;
        if result.is_ok() || result.as_ref().is_err_and(|e| e.is_conflict()) {
            self.invalidate(id).await;
        }
        result
    }

    async fn find(&self, query: &FindQuery) -> Result<Page> {
        self.inner.find(query).await
    }
}
