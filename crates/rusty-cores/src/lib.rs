//! # Rusty Cores - Local-first state synchronization
//!
//! Keeps a small set of slowly drifting, versioned entities ("cores")
//! consistent across an in-memory view, a persistent cache and a remote
//! source of truth, while reads and writes stay available offline.
//!
//! ## Features
//!
//! - **Optimistic updates**: validated, trend-derived and applied in memory immediately
//! - **Background sync**: FIFO worker with exponential backoff, jitter and dead letters
//! - **Offline queue**: SQLite-backed operations replayed in order on reconnect
//! - **Conflict resolution**: last-write-wins by `last_updated`, or a fixed side
//! - **Events**: typed core/sync broadcasts plus a throttled state-changed signal
//!
//! ## Example
//!
//! ```rust,no_run
//! use rusty_cores::{
//!     Collaborators, EngineConfig, MemoryCache, MemoryRemote, OfflineQueue, StateContainer,
//!     UpdateCause,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (_online, connectivity) = tokio::sync::watch::channel(true);
//!     let container = StateContainer::new(
//!         EngineConfig::default(),
//!         Collaborators {
//!             remote: Arc::new(MemoryRemote::new()),
//!             cache: Arc::new(MemoryCache::new()),
//!             offline: OfflineQueue::in_memory().await?,
//!             connectivity,
//!         },
//!     );
//!     container.initialize().await?;
//!
//!     if let Some(core) = container.get_by_id("focus") {
//!         let cause = UpdateCause::new("journal").with_cause_id("entry-1");
//!         container.update(core.with_value(62.0), Some(cause)).await?;
//!     }
//!
//!     container.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod conflict;
pub mod container;
pub mod error;
pub mod events;
pub mod models;
pub mod notify;
pub mod offline;
pub mod remote;
pub mod tracker;
pub mod worker;

pub use cache::{CacheEntry, CacheStats, CacheStore, EntityContext, FilesystemCache, MemoryCache};
pub use config::EngineConfig;
pub use conflict::{resolve, ConflictResolver, Resolution, SyncStrategy};
pub use container::{Collaborators, StateContainer};
pub use error::{EngineError, ErrorKind, RecoveryAction, RemoteError, Result};
pub use events::{EventBus, Listener, Subscription};
pub use models::{
    CoreUpdateEvent, CoreUpdateKind, Milestone, OfflineOperation, QueuedUpdate, SyncEvent, Trend,
    UpdateCause, UpdateKind, VersionedEntity,
};
pub use notify::StateChanged;
pub use offline::{OfflineQueue, ReplayReport};
pub use remote::{MemoryRemote, PushOutcome, RemoteSource};
pub use tracker::{ResourceKind, ResourceTracker, TrackedResource};
pub use worker::{DeadLetter, RetryPolicy, SyncReport, SyncWorker};
