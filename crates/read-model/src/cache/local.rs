use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::ReadModelId;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{CacheEntry, CacheTier};
use crate::CacheError;

/// Process-local cache tier.
///
/// Bounded by entry count with FIFO eviction; expired entries are dropped
/// on read. Never fails.
#[derive(Clone)]
pub struct LocalCache {
    entries: Arc<DashMap<ReadModelId, CacheEntry>>,
    /// Insertion order; may hold keys already removed from `entries`.
    order: Arc<Mutex<VecDeque<ReadModelId>>>,
    capacity: usize,
    ttl: Duration,
}

impl LocalCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::with_capacity(capacity)),
            order: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, key: &ReadModelId) -> Option<CacheEntry> {
        let entry = self.entries.get(key)?;
        if entry.is_expired(Utc::now()) {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.clone())
    }

    pub fn insert(&self, entry: CacheEntry) {
        if self.capacity == 0 {
            return;
        }

        let key = entry.key.clone();
        let is_new = !self.entries.contains_key(&key);
        if is_new && self.entries.len() >= self.capacity {
            self.evict_one();
        }

        self.entries.insert(key.clone(), entry);
        if is_new {
            let mut order = self.order.lock();
            order.push_back(key);
            if order.len() > self.capacity * 2 {
                order.retain(|k| self.entries.contains_key(k));
            }
        }
    }

    pub fn remove(&self, key: &ReadModelId) {
        self.entries.remove(key);
    }

    pub fn remove_all(&self) {
        self.entries.clear();
        self.order.lock().clear();
    }

    /// Pops the oldest key still present, skipping keys already removed.
    fn evict_one(&self) {
        let mut order = self.order.lock();
        while let Some(key) = order.pop_front() {
            if self.entries.remove(&key).is_some() {
                break;
            }
        }
    }
}

#[async_trait]
impl CacheTier for LocalCache {
    async fn get(&self, key: &ReadModelId) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.lookup(key))
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        self.insert(entry);
        Ok(())
    }

    async fn invalidate(&self, key: &ReadModelId) -> Result<(), CacheError> {
        self.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.remove_all();
        Ok(())
    }
}
