//! Read side storage: versioned read models, caching and queries.

pub mod cache;
pub mod engine;
pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod query;
pub mod store;

pub use cache::{CacheConfig, CacheEntry, CacheTier, CachedReadModelStore, InMemoryDistributedCache, LocalCache};
pub use common::ReadModelId;
pub use engine::{QueryConfig, QueryEngine};
pub use error::{CacheError, ReadModelError, Result};
pub use memory::InMemoryReadModelStore;
pub use model::{Document, FieldRef, ModelUpdate, ReadModel, Version};
pub use postgres::PostgresReadModelStore;
pub use query::{Condition, Filter, FindQuery, Operator, Page, SortDirection, SortKey};
pub use store::ReadModelStore;
