// File: rusty-cores/src/container.rs
// Purpose: Orchestrator owning the in-memory cores and coordinating cache, sync and offline replay

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::cache::{self, CacheStats, CacheStore, EntityContext};
use crate::config::EngineConfig;
use crate::conflict::ConflictResolver;
use crate::error::{EngineError, RecoveryAction, Result};
use crate::events::{EventBus, Subscription};
use crate::models::{
    CoreUpdateEvent, CoreUpdateKind, OfflineOperation, QueuedUpdate, SyncEvent, Trend,
    UpdateCause, VersionedEntity, BATCH_TARGET,
};
use crate::notify::{ChangeNotifier, StateChanged};
use crate::offline::{OfflineQueue, ReplayReport};
use crate::remote::{with_timeout, RemoteSource};
use crate::tracker::{ResourceKind, ResourceTracker, TrackedResource};
use crate::worker::{DeadLetter, RetryPolicy, SyncReport, SyncWorker};

/// Everything the container talks to but does not own the behavior of
pub struct Collaborators {
    pub remote: Arc<dyn RemoteSource>,
    pub cache: Arc<dyn CacheStore>,
    pub offline: OfflineQueue,
    /// `true` while the remote is reachable
    pub connectivity: watch::Receiver<bool>,
}

impl Collaborators {
    /// Build the cache and offline queue described by `config`
    pub async fn from_config(
        config: &EngineConfig,
        remote: Arc<dyn RemoteSource>,
        connectivity: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            remote,
            cache: cache::from_config(&config.cache).await?,
            offline: OfflineQueue::open(&config.offline.database_url).await?,
            connectivity,
        })
    }
}

struct Inner {
    config: EngineConfig,
    entities: Arc<RwLock<Vec<VersionedEntity>>>,
    mutation_guard: tokio::sync::Mutex<()>,
    sync_guard: tokio::sync::Mutex<()>,
    remote: Arc<dyn RemoteSource>,
    cache: Arc<dyn CacheStore>,
    offline: OfflineQueue,
    worker: Arc<SyncWorker>,
    resolver: ConflictResolver,
    events: EventBus,
    notifier: ChangeNotifier,
    tracker: ResourceTracker,
    connectivity: watch::Receiver<bool>,
    last_error: Mutex<Option<EngineError>>,
    cache_stats: Mutex<CacheStats>,
    shutdown: watch::Sender<bool>,
    background: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
    disposed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.notifier.shutdown();
    }
}

/// Owner of the authoritative in-memory cores.
///
/// Reads are synchronous snapshots. Mutations (`update`, `batch_update`,
/// `refresh` and the internal merge paths) run one at a time behind a single
/// guard, are applied optimistically, and are routed to the sync worker when
/// connected or to the offline queue when not.
#[derive(Clone)]
pub struct StateContainer {
    inner: Arc<Inner>,
}

impl StateContainer {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let tracker = ResourceTracker::new();
        let events = EventBus::new(config.events.capacity(), tracker.clone());
        let resolver = ConflictResolver::new(config.sync.strategy);
        let worker = Arc::new(SyncWorker::new(
            Arc::clone(&collaborators.remote),
            resolver,
            RetryPolicy::from_config(&config.sync),
            config.sync.remote_timeout(),
            events.clone(),
        ));
        let notifier = ChangeNotifier::new(
            config.notify.min_interval(),
            config.events.capacity(),
            tracker.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                entities: Arc::new(RwLock::new(Vec::new())),
                mutation_guard: tokio::sync::Mutex::new(()),
                sync_guard: tokio::sync::Mutex::new(()),
                remote: collaborators.remote,
                cache: collaborators.cache,
                offline: collaborators.offline,
                worker,
                resolver,
                events,
                notifier,
                tracker,
                connectivity: collaborators.connectivity,
                last_error: Mutex::new(None),
                cache_stats: Mutex::new(CacheStats::default()),
                shutdown,
                background: Mutex::new(None),
                initialized: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Load cores and start background work.
    ///
    /// Cached cores are served immediately and refreshed from the remote in the
    /// background. With an empty cache the remote is read inline; with an empty
    /// cache and no connectivity this fails with a network error, but the
    /// container keeps running and loads once connectivity returns.
    pub async fn initialize(&self) -> Result<()> {
        self.ensure_live()?;
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let entities = Arc::clone(&self.inner.entities);
        self.inner
            .notifier
            .start(move || read_lock(&entities).clone());

        let cached = self.load_cached().await;
        let result = if !cached.is_empty() {
            tracing::info!(count = cached.len(), "Loaded cores from cache");
            {
                let _guard = self.inner.mutation_guard.lock().await;
                *write_lock(&self.inner.entities) = cached;
            }
            self.inner.notifier.signal();
            self.start_background(true);
            Ok(())
        } else if self.is_connected() {
            let loaded = async {
                let _guard = self.inner.mutation_guard.lock().await;
                self.pull_remote_locked().await
            }
            .await;
            self.start_background(false);
            loaded
        } else {
            self.start_background(false);
            Err(EngineError::Network(
                "no cached data and no connectivity".into(),
            ))
        };

        self.record(result)
    }

    /// Every core, ordered by id
    pub fn get_all(&self) -> Vec<VersionedEntity> {
        read_lock(&self.inner.entities).clone()
    }

    pub fn get_by_id(&self, id: &str) -> Option<VersionedEntity> {
        read_lock(&self.inner.entities)
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connectivity.borrow()
    }

    /// Apply a new value for one core.
    ///
    /// The stored trend is derived from the value delta, milestones only ever
    /// move to achieved, and `last_updated` is stamped here. Returns the core
    /// as stored.
    pub async fn update(
        &self,
        entity: VersionedEntity,
        cause: Option<UpdateCause>,
    ) -> Result<VersionedEntity> {
        let result: Result<VersionedEntity> = async {
            self.ensure_live()?;
            entity.validate()?;

            let _guard = self.inner.mutation_guard.lock().await;
            let current = self
                .get_by_id(&entity.id)
                .ok_or_else(|| EngineError::Navigation(entity.id.clone()))?;
            let next = derive_next(&current, entity)?;

            let event_cause = cause.clone().unwrap_or_default();
            self.apply_locked(Some(&current), next.clone(), &event_cause).await;
            self.inner.notifier.signal();

            self.route(QueuedUpdate::single(next.clone(), cause)).await?;
            Ok(next)
        }
        .await;

        self.record(result)
    }

    /// Apply several cores at once; nothing is applied if any of them is rejected.
    ///
    /// Each core gets its own events, followed by one batch event. One queued
    /// update carries the whole batch.
    pub async fn batch_update(
        &self,
        entities: Vec<VersionedEntity>,
        cause: Option<UpdateCause>,
    ) -> Result<Vec<VersionedEntity>> {
        let result: Result<Vec<VersionedEntity>> = async {
            self.ensure_live()?;
            if entities.is_empty() {
                return Ok(Vec::new());
            }
            for entity in &entities {
                entity.validate()?;
            }

            let _guard = self.inner.mutation_guard.lock().await;
            let mut working = self.get_all();
            let mut changes: Vec<(VersionedEntity, VersionedEntity)> = Vec::new();

            for entity in entities {
                let slot = working
                    .iter_mut()
                    .find(|e| e.id == entity.id)
                    .ok_or_else(|| EngineError::Navigation(entity.id.clone()))?;
                let next = derive_next(slot, entity)?;
                changes.push((slot.clone(), next.clone()));
                *slot = next;
            }

            let event_cause = cause.clone().unwrap_or_default();
            for (previous, next) in &changes {
                self.apply_locked(Some(previous), next.clone(), &event_cause)
                    .await;
            }

            let mut accepted: Vec<VersionedEntity> = Vec::new();
            for (_, next) in changes.into_iter().rev() {
                if !accepted.iter().any(|e| e.id == next.id) {
                    accepted.push(next);
                }
            }
            accepted.reverse();

            self.inner.events.emit_core(CoreUpdateEvent::new(
                BATCH_TARGET,
                CoreUpdateKind::BatchUpdate {
                    entity_ids: accepted.iter().map(|e| e.id.clone()).collect(),
                },
                &event_cause,
            ));
            self.inner.notifier.signal();

            self.route(QueuedUpdate::batch(accepted.clone(), cause))
                .await?;
            Ok(accepted)
        }
        .await;

        self.record(result)
    }

    /// Reload cores. Without `force` the cache is merged in and a cache miss or
    /// failure falls back to the remote; with `force` the remote is read and
    /// the cache rewritten.
    pub async fn refresh(&self, force: bool) -> Result<()> {
        let result: Result<()> = async {
            self.ensure_live()?;
            let _guard = self.inner.mutation_guard.lock().await;

            if !force {
                let cached: Vec<VersionedEntity> = match self.inner.cache.entries().await {
                    Ok(entries) => entries.into_iter().map(|e| e.entity).collect(),
                    Err(e) => {
                        self.cache_failed("refresh", &e);
                        Vec::new()
                    }
                };

                if !cached.is_empty() {
                    self.bump_stats(|s| s.hits += cached.len() as u64);
                    self.merge_locked(
                        cached,
                        &UpdateCause::new("cache"),
                        ConflictResolver::default(),
                        false,
                    )
                    .await;
                    return Ok(());
                }

                self.bump_stats(|s| s.misses += 1);
                tracing::debug!("Cache empty, refreshing from remote");
            }

            self.pull_remote_locked().await
        }
        .await;

        if result.is_ok() {
            self.inner.notifier.signal();
        }
        self.record(result)
    }

    /// Reconcile a set of cores against the in-memory copies.
    ///
    /// Each core is resolved with the configured strategy; winners that differ
    /// from memory are applied. Returns the resolved cores.
    pub async fn resolve_core_conflicts(
        &self,
        entities: Vec<VersionedEntity>,
    ) -> Result<Vec<VersionedEntity>> {
        let result: Result<Vec<VersionedEntity>> = async {
            self.ensure_live()?;
            for entity in &entities {
                entity.validate()?;
            }
            let _guard = self.inner.mutation_guard.lock().await;
            let resolver = self.inner.resolver;
            Ok(self
                .merge_locked(entities, &UpdateCause::new("conflict-sweep"), resolver, true)
                .await)
        }
        .await;

        self.inner.notifier.signal();
        self.record(result)
    }

    /// Replay offline operations and push every queued update now, ignoring backoff
    pub async fn force_sync(&self) -> Result<SyncReport> {
        let result: Result<SyncReport> = async {
            self.ensure_live()?;
            if !self.is_connected() {
                return Err(EngineError::Network("cannot sync while offline".into()));
            }
            self.sync_cycle(true).await
        }
        .await;

        self.record(result)
    }

    /// Give dead-lettered updates a fresh attempt budget and sync
    pub async fn retry(&self) -> Result<SyncReport> {
        let result: Result<SyncReport> = async {
            self.ensure_live()?;
            let requeued = self.inner.worker.requeue_dead_letters().await;
            tracing::info!(requeued, "Retrying dead-lettered updates");
            if !self.is_connected() {
                self.hand_off_pending().await?;
                return Ok(SyncReport::default());
            }
            self.sync_cycle(true).await
        }
        .await;

        self.record(result)
    }

    /// Replay the offline queue oldest first, stopping at the first failure.
    /// Runs on its own whenever connectivity comes back.
    pub async fn drain_on_reconnect(&self) -> Result<ReplayReport> {
        let result: Result<ReplayReport> = async {
            self.ensure_live()?;
            if !self.is_connected() {
                return Err(EngineError::Network("cannot replay while offline".into()));
            }
            let _sync = self.inner.sync_guard.lock().await;
            self.replay_offline().await
        }
        .await;

        self.record(result)
    }

    pub async fn refresh_data(&self) -> Result<()> {
        self.refresh(true).await
    }

    /// Drop every cache entry and rewrite it from memory
    pub async fn clear_cache(&self) -> Result<()> {
        let result: Result<()> = async {
            self.ensure_live()?;
            let _guard = self.inner.mutation_guard.lock().await;
            self.inner.cache.clear().await.map_err(EngineError::cache)?;
            *self
                .inner
                .cache_stats
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = CacheStats::default();

            for entity in self.get_all() {
                if let Err(e) = self.inner.cache.put(&entity).await {
                    self.cache_failed("repopulate", &e);
                }
            }
            tracing::info!("Cache cleared");
            Ok(())
        }
        .await;

        self.record(result)
    }

    /// Run a recovery action suggested by [`EngineError::recovery_actions`]
    pub async fn recover(&self, action: RecoveryAction) -> Result<()> {
        let result = match action {
            RecoveryAction::Retry => self.retry().await.map(|_| ()),
            RecoveryAction::RefreshData => self.refresh_data().await,
            RecoveryAction::ClearCache => self.clear_cache().await,
            RecoveryAction::ForceSync => self.force_sync().await.map(|_| ()),
        };

        if result.is_ok() {
            self.clear_error();
        }
        result
    }

    /// Most recent error returned by any operation
    pub fn last_error(&self) -> Option<EngineError> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_error(&self) {
        *self
            .inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Throttled snapshots of the whole state
    pub fn subscribe_changes(&self) -> Subscription<StateChanged> {
        self.inner.notifier.subscribe()
    }

    pub fn subscribe_core_updates(&self) -> Subscription<CoreUpdateEvent> {
        self.inner.events.subscribe_core()
    }

    pub fn subscribe_sync_events(&self) -> Subscription<SyncEvent> {
        self.inner.events.subscribe_sync()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Cached display context for a core. Cache failures read as a miss.
    pub async fn entity_context(&self, id: &str) -> Result<Option<EntityContext>> {
        if self.get_by_id(id).is_none() {
            return self.record(Err(EngineError::Navigation(id.to_string())));
        }

        match self.inner.cache.get_context(id).await {
            Ok(Some(context)) => {
                self.bump_stats(|s| s.hits += 1);
                Ok(Some(context))
            }
            Ok(None) => {
                self.bump_stats(|s| s.misses += 1);
                Ok(None)
            }
            Err(e) => {
                self.cache_failed("context read", &e);
                Ok(None)
            }
        }
    }

    pub async fn put_entity_context(&self, id: &str, data: serde_json::Value) -> Result<()> {
        let result: Result<()> = async {
            if self.get_by_id(id).is_none() {
                return Err(EngineError::Navigation(id.to_string()));
            }
            self.inner
                .cache
                .put_context(id, EntityContext::new(data))
                .await
                .map_err(EngineError::cache)
        }
        .await;

        self.record(result)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner
            .cache_stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Updates waiting in the sync worker
    pub async fn pending_sync(&self) -> usize {
        self.inner.worker.len().await
    }

    /// Operations waiting in the offline queue
    pub async fn pending_offline(&self) -> Result<usize> {
        let result = self
            .inner
            .offline
            .len()
            .await
            .map_err(EngineError::persistence);
        self.record(result)
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.worker.dead_letters().await
    }

    pub fn outstanding_resources(&self) -> Vec<TrackedResource> {
        self.inner.tracker.outstanding()
    }

    /// Subscriptions and tasks alive longer than the configured maximum age
    pub fn detect_leaks(&self) -> Vec<TrackedResource> {
        self.inner
            .tracker
            .detect_leaks(self.inner.config.diagnostics.max_resource_age())
    }

    /// Stop background work and hand unsynced updates to the offline queue.
    ///
    /// Every later operation fails with [`EngineError::ShutDown`].
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.worker.stop();
        let _ = self.inner.shutdown.send(true);
        let handle = self
            .inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle {
            let grace = self.inner.config.sync.remote_timeout();
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                tracing::warn!("Background sync did not stop in time, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }
        self.inner.notifier.shutdown();
        self.inner.worker.release_in_flight().await;

        if let Err(e) = self.hand_off_pending().await {
            tracing::error!(error = %e, "Failed to persist unsynced updates on dispose");
        }
        tracing::info!("State container disposed");
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            Err(EngineError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            tracing::warn!(error = %e, kind = ?e.kind(), "Operation failed");
            *self
                .inner
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(e.clone());
        }
        result
    }

    fn bump_stats(&self, f: impl FnOnce(&mut CacheStats)) {
        f(&mut self
            .inner
            .cache_stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner));
    }

    fn cache_failed(&self, operation: &'static str, error: &anyhow::Error) {
        tracing::warn!(operation, error = %format!("{:#}", error), "Cache unavailable, continuing without it");
        self.bump_stats(|s| s.errors += 1);
    }

    async fn load_cached(&self) -> Vec<VersionedEntity> {
        match self.inner.cache.entries().await {
            Ok(entries) => {
                if entries.is_empty() {
                    self.bump_stats(|s| s.misses += 1);
                } else {
                    self.bump_stats(|s| s.hits += entries.len() as u64);
                }
                let mut entities: Vec<VersionedEntity> =
                    entries.into_iter().map(|e| e.entity).collect();
                entities.sort_by(|a, b| a.id.cmp(&b.id));
                entities
            }
            Err(e) => {
                self.cache_failed("initial load", &e);
                Vec::new()
            }
        }
    }

    /// Replace one core in memory, emit its events and refresh its cache entry.
    /// Caller holds the mutation guard.
    async fn apply_locked(
        &self,
        previous: Option<&VersionedEntity>,
        next: VersionedEntity,
        cause: &UpdateCause,
    ) {
        {
            let mut entities = write_lock(&self.inner.entities);
            match entities.iter_mut().find(|e| e.id == next.id) {
                Some(slot) => *slot = next.clone(),
                None => {
                    entities.push(next.clone());
                    entities.sort_by(|a, b| a.id.cmp(&b.id));
                }
            }
        }

        if let Some(previous) = previous {
            for event in CoreUpdateEvent::diff(previous, &next, cause) {
                self.inner.events.emit_core(event);
            }
        }

        if let Err(e) = self.inner.cache.invalidate(&next.id).await {
            self.cache_failed("invalidate", &e);
        } else {
            self.bump_stats(|s| s.invalidations += 1);
        }
        if let Err(e) = self.inner.cache.put(&next).await {
            self.cache_failed("write", &e);
        }
    }

    /// Resolve incoming cores against memory and apply the winners.
    /// Caller holds the mutation guard.
    async fn merge_locked(
        &self,
        incoming: Vec<VersionedEntity>,
        cause: &UpdateCause,
        resolver: ConflictResolver,
        include_local: bool,
    ) -> Vec<VersionedEntity> {
        let local = self.get_all();
        let mut resolved = Vec::with_capacity(incoming.len());

        for resolution in resolver.resolve_all(&local, &incoming) {
            let previous = local.iter().find(|e| e.id == resolution.winner.id);
            if previous != Some(&resolution.winner) {
                self.apply_locked(previous, resolution.winner.clone(), cause)
                    .await;
            }
            if resolution.remote_won || include_local {
                resolved.push(resolution.winner);
            }
        }

        resolved
    }

    /// Caller holds the mutation guard
    async fn pull_remote_locked(&self) -> Result<()> {
        let timeout = self.inner.config.sync.remote_timeout();
        let incoming = with_timeout(timeout, self.inner.remote.fetch_all()).await?;
        tracing::info!(count = incoming.len(), "Fetched cores from remote");

        let resolver = self.inner.resolver;
        self.merge_locked(incoming, &UpdateCause::new("remote"), resolver, false)
            .await;
        self.inner.notifier.signal();
        Ok(())
    }

    /// Send an accepted mutation to the worker when connected, else persist it
    async fn route(&self, update: QueuedUpdate) -> Result<()> {
        if self.is_connected() {
            self.inner.worker.enqueue(update).await;
            return Ok(());
        }

        let operation = OfflineOperation::from_update(&update);
        match self.inner.offline.enqueue(&operation).await {
            Ok(()) => {
                let queue_size = self
                    .inner
                    .offline
                    .len()
                    .await
                    .map_err(EngineError::persistence)?;
                tracing::info!(update_id = %update.id, queue_size, "Offline, update persisted for replay");
                self.inner
                    .events
                    .emit_sync(SyncEvent::UpdateQueued { queue_size });
                Ok(())
            }
            Err(e) => {
                // Keep the update in memory so it is not lost
                self.inner.worker.enqueue(update).await;
                Err(EngineError::persistence(e))
            }
        }
    }

    /// Adopt remote winners from a push, unless memory moved on since
    async fn adopt(&self, adopted: Vec<VersionedEntity>) {
        if adopted.is_empty() {
            return;
        }

        let _guard = self.inner.mutation_guard.lock().await;
        let cause = UpdateCause::new("remote");
        for entity in adopted {
            let current = self.get_by_id(&entity.id);
            let stale = current
                .as_ref()
                .map_or(false, |c| c.last_updated > entity.last_updated);
            if stale || current.as_ref() == Some(&entity) {
                continue;
            }
            tracing::info!(entity_id = %entity.id, "Adopting remote version");
            self.apply_locked(current.as_ref(), entity, &cause).await;
        }
        self.inner.notifier.signal();
    }

    /// Replay one offline operation through the same push path as live updates
    async fn replay_operation(&self, operation: OfflineOperation) -> Result<()> {
        let update = operation.to_update();
        let cause = update.metadata.cause.clone().unwrap_or_default();

        {
            let _guard = self.inner.mutation_guard.lock().await;
            let mut changed = false;
            for snapshot in &update.entities {
                let current = self.get_by_id(&snapshot.id);
                if current
                    .as_ref()
                    .map_or(true, |c| c.last_updated < snapshot.last_updated)
                {
                    self.apply_locked(current.as_ref(), snapshot.clone(), &cause)
                        .await;
                    changed = true;
                }
            }
            if changed {
                self.inner.notifier.signal();
            }
        }

        let pushed = self.inner.worker.push_now(&update).await?;
        tracing::info!(operation_id = %operation.id, "Offline operation replayed");
        self.adopt(pushed.adopted).await;
        Ok(())
    }

    async fn replay_offline(&self) -> Result<ReplayReport> {
        let this = self.clone();
        self.inner
            .offline
            .drain_with(move |operation| {
                let this = this.clone();
                async move { this.replay_operation(operation).await }
            })
            .await
            .map_err(EngineError::persistence)
    }

    /// Replay offline operations, then drain the worker
    async fn sync_cycle(&self, ignore_backoff: bool) -> Result<SyncReport> {
        let _sync = self.inner.sync_guard.lock().await;

        let replay = self.replay_offline().await?;
        if let Some((id, error)) = replay.halted_on {
            tracing::warn!(operation_id = %id, remaining = replay.remaining, "Offline replay halted");
            return Err(EngineError::SyncFailure(error));
        }

        let mut report = self.inner.worker.drain(ignore_backoff).await;
        let mut applied = replay.replayed;
        applied.append(&mut report.applied);
        report.applied = applied;
        self.adopt(std::mem::take(&mut report.adopted)).await;
        Ok(report)
    }

    /// Drain the worker on a wake-up or retry timer; offline, hand its work to the queue instead
    async fn drain_worker(&self) {
        if !self.is_connected() {
            if let Err(e) = self.hand_off_pending().await {
                self.record::<()>(Err(e)).ok();
            }
            return;
        }

        let _sync = self.inner.sync_guard.lock().await;
        let report = self.inner.worker.drain(false).await;
        self.adopt(report.adopted).await;
    }

    /// Persist every update the worker has not started into the offline queue
    async fn hand_off_pending(&self) -> Result<()> {
        let pending = self.inner.worker.take_pending().await;
        if pending.is_empty() {
            return Ok(());
        }

        tracing::info!(count = pending.len(), "Moving unsynced updates to the offline queue");
        for (index, update) in pending.iter().enumerate() {
            if let Err(e) = self
                .inner
                .offline
                .enqueue(&OfflineOperation::from_update(update))
                .await
            {
                for unsaved in &pending[index..] {
                    self.inner.worker.enqueue(unsaved.clone()).await;
                }
                return Err(EngineError::persistence(e));
            }
        }
        Ok(())
    }

    async fn on_start(&self, refresh_from_remote: bool) {
        if !self.is_connected() {
            return;
        }
        if let Err(e) = self.sync_cycle(false).await {
            self.record::<()>(Err(e)).ok();
        }
        if refresh_from_remote {
            let _ = self.refresh(true).await;
        }
    }

    async fn on_connectivity(&self, connected: bool) {
        tracing::info!(connected, "Connectivity changed");
        if !connected {
            if let Err(e) = self.hand_off_pending().await {
                self.record::<()>(Err(e)).ok();
            }
            return;
        }

        match self.sync_cycle(false).await {
            Ok(report) => {
                tracing::info!(applied = report.applied.len(), "Reconnected and synced");
            }
            Err(e) => {
                self.record::<()>(Err(e)).ok();
            }
        }
        let empty = read_lock(&self.inner.entities).is_empty();
        if empty {
            let _ = self.refresh(true).await;
        }
    }

    async fn on_heartbeat(&self) {
        if !self.is_connected() {
            return;
        }
        tracing::debug!("Sync heartbeat");

        let offline_waiting = self.inner.offline.len().await.unwrap_or(0) > 0;
        if offline_waiting || !self.inner.worker.is_empty().await {
            if let Err(e) = self.sync_cycle(false).await {
                self.record::<()>(Err(e)).ok();
            }
        }

        let timeout = self.inner.config.sync.remote_timeout();
        match with_timeout(timeout, self.inner.remote.has_pending_remote_changes()).await {
            Ok(true) => {
                let _ = self.refresh(true).await;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Could not check for remote changes");
            }
        }
    }

    fn start_background(&self, refresh_from_remote: bool) {
        let weak = Arc::downgrade(&self.inner);
        let worker = Arc::clone(&self.inner.worker);
        let mut connectivity = self.inner.connectivity.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let interval = self.inner.config.sync.interval();
        let guard = self.inner.tracker.track(ResourceKind::Task, "sync-heartbeat");

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _ = connectivity.borrow_and_update();
            if let Some(container) = upgrade(&weak) {
                container.on_start(refresh_from_remote).await;
            }

            let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut connectivity_open = true;

            loop {
                let retry_at = worker.next_retry_at().await;

                tokio::select! {
                    _ = shutdown.changed() => break,
                    changed = connectivity.changed(), if connectivity_open => {
                        if changed.is_err() {
                            connectivity_open = false;
                            continue;
                        }
                        let connected = *connectivity.borrow_and_update();
                        run(&weak, |c| async move { c.on_connectivity(connected).await }).await;
                    }
                    _ = heartbeat.tick() => {
                        run(&weak, |c| async move { c.on_heartbeat().await }).await;
                    }
                    _ = worker.woken() => {
                        run(&weak, |c| async move { c.drain_worker().await }).await;
                    }
                    _ = tokio::time::sleep_until(retry_at.unwrap_or_else(|| Instant::now() + interval)), if retry_at.is_some() => {
                        run(&weak, |c| async move { c.drain_worker().await }).await;
                    }
                }

                if weak.strong_count() == 0 {
                    break;
                }
            }

            tracing::debug!("Sync loop stopped");
        });

        *self
            .inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<StateContainer> {
    weak.upgrade().map(|inner| StateContainer { inner })
}

async fn run<F, Fut>(weak: &Weak<Inner>, f: F)
where
    F: FnOnce(StateContainer) -> Fut,
    Fut: Future<Output = ()>,
{
    if let Some(container) = upgrade(weak) {
        f(container).await;
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Compute the stored version of `incoming` on top of `current`
fn derive_next(current: &VersionedEntity, incoming: VersionedEntity) -> Result<VersionedEntity> {
    if incoming.name != current.name {
        return Err(EngineError::Validation(format!(
            "name of '{}' cannot change",
            current.id
        )));
    }

    let mut next = incoming;
    next.trend = Trend::from_delta(current.value, next.value);
    next.last_updated = current.next_timestamp();

    for milestone in &mut next.milestones {
        let was_achieved = current
            .milestone(&milestone.id)
            .map_or(false, |m| m.achieved);
        milestone.achieved = milestone.achieved || was_achieved || next.value >= milestone.threshold;
    }
    for kept in &current.milestones {
        if next.milestone(&kept.id).is_none() {
            let mut kept = kept.clone();
            kept.achieved = kept.achieved || next.value >= kept.threshold;
            next.milestones.push(kept);
        }
    }

    Ok(next)
}
