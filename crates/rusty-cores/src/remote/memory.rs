//! In-process remote, used by tests and local-only setups

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::RemoteError;
use crate::models::{QueuedUpdate, VersionedEntity};
use crate::remote::{PushOutcome, RemoteSource};

#[derive(Default)]
struct RemoteState {
    entities: HashMap<String, VersionedEntity>,
    applied: HashSet<Uuid>,
    scripted_failures: VecDeque<RemoteError>,
    unreachable: bool,
    latency: Option<Duration>,
    pending_changes: bool,
    push_count: usize,
}

/// Remote source of truth held in memory.
///
/// Rejects pushes carrying an entity older than its own copy with
/// [`PushOutcome::Conflict`], remembers applied update ids, and can be
/// scripted to fail or stall.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_entities(entities: Vec<VersionedEntity>) -> Self {
        let remote = Self::new();
        {
            let mut state = remote.state.lock().await;
            for entity in entities {
                state.entities.insert(entity.id.clone(), entity);
            }
        }
        remote
    }

    /// Simulate another device writing a core
    pub async fn set_entity(&self, entity: VersionedEntity) {
        let mut state = self.state.lock().await;
        state.entities.insert(entity.id.clone(), entity);
        state.pending_changes = true;
    }

    pub async fn entity(&self, id: &str) -> Option<VersionedEntity> {
        self.state.lock().await.entities.get(id).cloned()
    }

    /// Fail the next `times` pushes with `error`
    pub async fn fail_next(&self, times: usize, error: RemoteError) {
        let mut state = self.state.lock().await;
        for _ in 0..times {
            state.scripted_failures.push_back(error.clone());
        }
    }

    /// Every call fails with a network error while unreachable
    pub async fn set_reachable(&self, reachable: bool) {
        self.state.lock().await.unreachable = !reachable;
    }

    /// Delay every call, to exercise timeouts
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.latency = latency;
    }

    /// Number of push calls received, failed ones included
    pub async fn push_count(&self) -> usize {
        self.state.lock().await.push_count
    }

    async fn gate(&self) -> Result<(), RemoteError> {
        let (latency, unreachable) = {
            let state = self.state.lock().await;
            (state.latency, state.unreachable)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if unreachable {
            return Err(RemoteError::Network("remote unreachable".into()));
        }

        Ok(())
    }
}

#[async_trait]
impl RemoteSource for MemoryRemote {
    async fn fetch_all(&self) -> Result<Vec<VersionedEntity>, RemoteError> {
        self.gate().await?;

        let mut state = self.state.lock().await;
        state.pending_changes = false;

        let mut entities: Vec<VersionedEntity> = state.entities.values().cloned().collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entities)
    }

    async fn push(&self, update: &QueuedUpdate) -> Result<PushOutcome, RemoteError> {
        self.state.lock().await.push_count += 1;
        self.gate().await?;

        let mut state = self.state.lock().await;

        if let Some(error) = state.scripted_failures.pop_front() {
            return Err(error);
        }

        if state.applied.contains(&update.id) {
            return Ok(PushOutcome::Applied);
        }

        let newer: Vec<VersionedEntity> = update
            .entities
            .iter()
            .filter_map(|local| {
                state
                    .entities
                    .get(&local.id)
                    .filter(|remote| remote.last_updated > local.last_updated)
                    .cloned()
            })
            .collect();

        if !newer.is_empty() {
            return Ok(PushOutcome::Conflict { remote: newer });
        }

        for entity in &update.entities {
            state.entities.insert(entity.id.clone(), entity.clone());
        }
        state.applied.insert(update.id);

        Ok(PushOutcome::Applied)
    }

    async fn has_pending_remote_changes(&self) -> Result<bool, RemoteError> {
        self.gate().await?;
        Ok(self.state.lock().await.pending_changes)
    }
}
