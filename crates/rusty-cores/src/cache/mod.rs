//! Cache backends for cores and their derived display context
//!
//! The cache is a best-effort accelerator. Entries never expire on a timer;
//! they are invalidated when a mutation for the same core is applied, and a
//! miss always falls back to the remote source of truth.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::models::VersionedEntity;

pub mod filesystem;
pub mod memory;

pub use filesystem::FilesystemCache;
pub use memory::MemoryCache;

/// A cached core with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub entity: VersionedEntity,

    /// When the entry was written
    pub cached_at: DateTime<Utc>,

    /// Set by `invalidate`; the entity stays readable as last known good
    #[serde(default)]
    pub stale: bool,
}

impl CacheEntry {
    pub fn new(entity: VersionedEntity) -> Self {
        Self {
            entity,
            cached_at: Utc::now(),
            stale: false,
        }
    }

    pub fn is_fresh(&self) -> bool {
        !self.stale
    }
}

/// Derived per-core display context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityContext {
    pub data: serde_json::Value,
    pub derived_at: DateTime<Utc>,
}

impl EntityContext {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            derived_at: Utc::now(),
        }
    }
}

/// Trait for cache backends
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get a cached core by id
    async fn get(&self, id: &str) -> Result<Option<CacheEntry>>;

    /// Write a fresh entry for a core
    async fn put(&self, entity: &VersionedEntity) -> Result<()>;

    /// Mark a core's entry stale and drop its derived context
    async fn invalidate(&self, id: &str) -> Result<()>;

    /// Get the derived context for a core
    async fn get_context(&self, id: &str) -> Result<Option<EntityContext>>;

    /// Store the derived context for a core
    async fn put_context(&self, id: &str, context: EntityContext) -> Result<()>;

    /// All cached entries, stale ones included
    async fn entries(&self) -> Result<Vec<CacheEntry>>;

    /// Remove everything
    async fn clear(&self) -> Result<()>;

    /// Get backend name
    fn name(&self) -> &'static str;
}

/// Build a cache backend from config
pub async fn from_config(config: &CacheConfig) -> Result<Arc<dyn CacheStore>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryCache::new())),
        "filesystem" => Ok(Arc::new(FilesystemCache::new(config.path.clone()).await?)),
        other => anyhow::bail!("Unknown cache backend: {}", other),
    }
}

/// Cache hit/miss counters kept by the container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub errors: u64,
}

impl CacheStats {
    /// Calculate cache hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
