//! Filesystem cache backend

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::cache::{CacheEntry, CacheStore, EntityContext};
use crate::models::VersionedEntity;

const ENTRY_SUFFIX: &str = ".core.json";
const CONTEXT_SUFFIX: &str = ".context.json";

/// Filesystem cache backend
///
/// Stores one JSON file per core and one per derived context.
/// Persistent across restarts, suitable for a single engine instance.
#[derive(Clone)]
pub struct FilesystemCache {
    root: PathBuf,
}

impl FilesystemCache {
    /// Create the backend, creating its directory if needed
    pub async fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .await
            .context("Failed to create cache directory")?;

        Ok(Self { root })
    }

    fn sanitize(id: &str) -> String {
        id.replace(['/', '\\', ':'], "_")
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}{}", Self::sanitize(id), ENTRY_SUFFIX))
    }

    fn context_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}{}", Self::sanitize(id), CONTEXT_SUFFIX))
    }

    async fn read_entry(&self, path: &Path) -> Result<Option<CacheEntry>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)
            .await
            .context("Failed to read cache file")?;

        let entry = serde_json::from_str(&content).context("Failed to deserialize cache entry")?;

        Ok(Some(entry))
    }

    async fn write_entry(&self, path: PathBuf, entry: &CacheEntry) -> Result<()> {
        let json = serde_json::to_string_pretty(entry).context("Failed to serialize cache entry")?;

        fs::write(&path, json)
            .await
            .context("Failed to write cache file")
    }
}

#[async_trait]
impl CacheStore for FilesystemCache {
    async fn get(&self, id: &str) -> Result<Option<CacheEntry>> {
        self.read_entry(&self.entry_path(id)).await
    }

    async fn put(&self, entity: &VersionedEntity) -> Result<()> {
        self.write_entry(self.entry_path(&entity.id), &CacheEntry::new(entity.clone()))
            .await
    }

    async fn invalidate(&self, id: &str) -> Result<()> {
        let path = self.entry_path(id);
        if let Some(mut entry) = self.read_entry(&path).await? {
            entry.stale = true;
            self.write_entry(path, &entry).await?;
        }

        let context_path = self.context_path(id);
        if context_path.exists() {
            fs::remove_file(&context_path)
                .await
                .context("Failed to delete context file")?;
        }

        Ok(())
    }

    async fn get_context(&self, id: &str) -> Result<Option<EntityContext>> {
        let path = self.context_path(id);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .context("Failed to read context file")?;

        let context = serde_json::from_str(&content).context("Failed to deserialize context")?;

        Ok(Some(context))
    }

    async fn put_context(&self, id: &str, context: EntityContext) -> Result<()> {
        let json = serde_json::to_string_pretty(&context).context("Failed to serialize context")?;

        fs::write(self.context_path(id), json)
            .await
            .context("Failed to write context file")
    }

    async fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.root)
            .await
            .context("Failed to read cache directory")?;

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let is_entry = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.ends_with(ENTRY_SUFFIX));

            if is_entry {
                if let Some(entry) = self.read_entry(&path).await? {
                    entries.push(entry);
                }
            }
        }

        Ok(entries)
    }

    async fn clear(&self) -> Result<()> {
        let mut dir = fs::read_dir(&self.root)
            .await
            .context("Failed to read cache directory")?;

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.is_file() {
                fs::remove_file(&path).await.ok();
            }
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}
