//! Contract of the remote source of truth
//!
//! Pushes must be idempotent per [`QueuedUpdate::id`]: a retried push with an
//! id the remote has already applied is acknowledged without reapplying it.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::error::RemoteError;
use crate::models::{QueuedUpdate, VersionedEntity};

pub mod memory;

pub use memory::MemoryRemote;

/// Result of a push the remote accepted for processing
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Every entity in the update was stored
    Applied,
    /// The remote holds newer copies of these entities; nothing was stored
    Conflict { remote: Vec<VersionedEntity> },
}

/// The remote source of truth
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetch every core the remote knows about
    async fn fetch_all(&self) -> Result<Vec<VersionedEntity>, RemoteError>;

    /// Push a single or batch update
    async fn push(&self, update: &QueuedUpdate) -> Result<PushOutcome, RemoteError>;

    /// Whether another writer changed something since the last `fetch_all`
    async fn has_pending_remote_changes(&self) -> Result<bool, RemoteError>;
}

/// Bound a remote call; running out of time counts as a transient failure
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(limit)),
    }
}
