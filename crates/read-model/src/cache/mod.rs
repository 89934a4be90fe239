//! Read-through / write-invalidate caching in front of a read-model store.
//!
//! Cache tiers hold [`CacheEntry`] values stamped with the version of the
//! model they copy. Writes never update a tier in place; they evict.

mod distributed;
mod layered;
mod local;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::ReadModelId;
use serde::{Deserialize, Serialize};

use crate::{CacheError, ReadModel, Version};

pub use distributed::InMemoryDistributedCache;
pub use layered::CachedReadModelStore;
pub use local::LocalCache;

/// A cached copy of a read model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: ReadModelId,
    pub value: ReadModel,
    pub version_stamp: Version,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(value: ReadModel, ttl: Duration) -> Self {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            key: value.id.clone(),
            version_stamp: value.version,
            cached_at: now,
            expires_at,
            value,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// An entry whose stamp disagrees with its value is never served.
    pub fn is_consistent(&self) -> bool {
        self.version_stamp == self.value.version && self.key == self.value.id
    }

    /// Age of the entry, zero if the clock moved backwards.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.cached_at).to_std().unwrap_or_default()
    }
}

/// One level of the cache hierarchy.
#[async_trait]
pub trait CacheTier: Send + Sync {
    async fn get(&self, key: &ReadModelId) -> Result<Option<CacheEntry>, CacheError>;

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError>;

    async fn invalidate(&self, key: &ReadModelId) -> Result<(), CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;
}

/// Cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Lifetime of a cached entry.
    #[serde(default = "default_ttl", with = "duration_secs")]
    pub ttl: Duration,

    /// Maximum entries in the local tier.
    #[serde(default = "default_local_capacity")]
    pub local_capacity: usize,

    /// How long a local hit may be served without checking the distributed
    /// tier. Zero means every local hit is revalidated.
    #[serde(default, with = "duration_secs")]
    pub staleness_tolerance: Duration,
}

fn default_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_local_capacity() -> usize {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            local_capacity: default_local_capacity(),
            staleness_tolerance: Duration::ZERO,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
