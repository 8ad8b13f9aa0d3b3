//! In-memory cache backend

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::cache::{CacheEntry, CacheStore, EntityContext};
use crate::models::VersionedEntity;

/// In-memory cache backend
///
/// Fast but non-persistent - cache is lost on restart.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    contexts: Arc<RwLock<HashMap<String, EntityContext>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached cores
    pub async fn size(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, id: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.read().await.get(id).cloned())
    }

    async fn put(&self, entity: &VersionedEntity) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(entity.id.clone(), CacheEntry::new(entity.clone()));
        Ok(())
    }

    async fn invalidate(&self, id: &str) -> Result<()> {
        if let Some(entry) = self.entries.write().await.get_mut(id) {
            entry.stale = true;
        }
        self.contexts.write().await.remove(id);
        Ok(())
    }

    async fn get_context(&self, id: &str) -> Result<Option<EntityContext>> {
        Ok(self.contexts.read().await.get(id).cloned())
    }

    async fn put_context(&self, id: &str, context: EntityContext) -> Result<()> {
        self.contexts.write().await.insert(id.to_string(), context);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<CacheEntry>> {
        Ok(self.entries.read().await.values().cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        self.contexts.write().await.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_cache_basic() {
        let cache = MemoryCache::new();
        let entity = VersionedEntity::new("a", "Focus", 50.0);

        cache.put(&entity).await.unwrap();

        let entry = cache.get("a").await.unwrap().unwrap();
        assert_eq!(entry.entity, entity);
        assert!(entry.is_fresh());
        assert!(cache.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_keeps_last_known_good() {
        let cache = MemoryCache::new();
        cache.put(&VersionedEntity::new("a", "Focus", 50.0)).await.unwrap();
        cache
            .put_context("a", EntityContext::new(serde_json::json!({"headline": "steady"})))
            .await
            .unwrap();

        cache.invalidate("a").await.unwrap();

        let entry = cache.get("a").await.unwrap().unwrap();
        assert!(entry.stale);
        assert_eq!(entry.entity.value, 50.0);
        assert!(cache.get_context("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_cache_clear() {
        let cache = MemoryCache::new();
        cache.put(&VersionedEntity::new("a", "Focus", 50.0)).await.unwrap();
        cache.put(&VersionedEntity::new("b", "Calm", 20.0)).await.unwrap();
        assert_eq!(cache.size().await, 2);

        cache.clear().await.unwrap();
        assert_eq!(cache.size().await, 0);
    }
}
