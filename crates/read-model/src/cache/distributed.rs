use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use common::ReadModelId;
use dashmap::DashMap;

use super::{CacheEntry, CacheTier};
use crate::CacheError;

/// Shared cache tier kept in process memory.
///
/// Entries are stored serialized, the way a networked cache would hold
/// them, so every read hands out an independent copy. Availability can be
/// switched off to exercise fail-open paths.
#[derive(Clone)]
pub struct InMemoryDistributedCache {
    entries: Arc<DashMap<ReadModelId, Vec<u8>>>,
    available: Arc<AtomicBool>,
}

impl Default for InMemoryDistributedCache {
    fn default() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl InMemoryDistributedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_available(&self) -> Result<(), CacheError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("distributed cache is down".to_string()))
        }
    }
}

#[async_trait]
impl CacheTier for InMemoryDistributedCache {
    async fn get(&self, key: &ReadModelId) -> Result<Option<CacheEntry>, CacheError> {
        self.ensure_available()?;

        let Some(bytes) = self.entries.get(key).map(|b| b.clone()) else {
            return Ok(None);
        };
        let entry: CacheEntry = serde_json::from_slice(&bytes)?;
        if entry.is_expired(Utc::now()) {
            self.entries.remove(key);
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        self.ensure_available()?;
        let bytes = serde_json::to_vec(&entry)?;
        self.entries.insert(entry.key.clone(), bytes);
        Ok(())
    }

    async fn invalidate(&self, key: &ReadModelId) -> Result<(), CacheError> {
        self.ensure_available()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.ensure_available()?;
        self.entries.clear();
        Ok(())
    }
}
