// File: rusty-cores/src/worker.rs
// Purpose: Drain queued updates against the remote with retry, backoff and conflict handling

use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::conflict::ConflictResolver;
use crate::error::RemoteError;
use crate::events::EventBus;
use crate::models::{QueuedUpdate, SyncEvent, UpdateKind, VersionedEntity};
use crate::remote::{with_timeout, PushOutcome, RemoteSource};

/// Conflict/re-push rounds allowed inside one attempt
const MAX_CONFLICT_ROUNDS: usize = 3;

/// Lifecycle of a queued update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Pending,
    InFlight,
    Retrying,
    Applied,
    DeadLettered,
}

/// An update waiting in the worker queue
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub update: QueuedUpdate,
    pub state: UpdateState,
    pub attempts: u32,
    pub next_attempt_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl QueueEntry {
    fn new(update: QueuedUpdate) -> Self {
        Self {
            update,
            state: UpdateState::Pending,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// An update that ran out of attempts, kept for inspection and manual retry
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub update: QueuedUpdate,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Exponential backoff with a capped multiplier plus random jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_multiplier: u32,
    pub max_jitter: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_multiplier: config.max_backoff_multiplier.max(1),
            max_jitter: config.max_jitter(),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Deterministic part of the delay after `attempt` failures
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let multiplier = 2u32.saturating_pow(exponent).min(self.max_multiplier);
        self.base_delay.saturating_mul(multiplier)
    }

    /// Backoff plus jitter in `0..=max_jitter`
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.backoff(attempt) + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// A push that went through, with whatever the remote made us adopt
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pushed {
    /// Remote copies that won conflict resolution
    pub adopted: Vec<VersionedEntity>,
    pub conflicts: usize,
}

/// What one drain pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub applied: Vec<Uuid>,
    pub retrying: Vec<Uuid>,
    pub dead_lettered: Vec<Uuid>,
    pub adopted: Vec<VersionedEntity>,
    pub conflicts: usize,
}

impl SyncReport {
    fn absorb(&mut self, pushed: Pushed) {
        self.adopted.extend(pushed.adopted);
        self.conflicts += pushed.conflicts;
    }
}

/// Background sync worker
pub struct SyncWorker {
    remote: Arc<dyn RemoteSource>,
    resolver: ConflictResolver,
    policy: RetryPolicy,
    timeout: Duration,
    queue: Mutex<VecDeque<QueueEntry>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    drain_guard: Mutex<()>,
    events: EventBus,
    wake: Notify,
    stopping: AtomicBool,
}

impl SyncWorker {
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        resolver: ConflictResolver,
        policy: RetryPolicy,
        timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            remote,
            resolver,
            policy,
            timeout,
            queue: Mutex::new(VecDeque::new()),
            dead_letters: Mutex::new(Vec::new()),
            drain_guard: Mutex::new(()),
            events,
            wake: Notify::new(),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Queue an update and wake the drain loop.
    ///
    /// Pending singles for any entity the new update carries are dropped: the
    /// new snapshot already contains their state. Entries in backoff stay.
    pub async fn enqueue(&self, update: QueuedUpdate) -> usize {
        let queue_size = {
            let mut queue = self.queue.lock().await;
            let before = queue.len();
            queue.retain(|entry| {
                !(entry.state == UpdateState::Pending
                    && entry.update.kind == UpdateKind::Single
                    && update.carries(entry.update.target()))
            });

            let superseded = before - queue.len();
            if superseded > 0 {
                tracing::debug!(update_id = %update.id, superseded, "Superseded pending updates");
            }

            queue.push_back(QueueEntry::new(update));
            queue.len()
        };

        self.events.emit_sync(SyncEvent::UpdateQueued { queue_size });
        self.wake.notify_one();
        queue_size
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    pub async fn entries(&self) -> Vec<QueueEntry> {
        self.queue.lock().await.iter().cloned().collect()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().await.clone()
    }

    /// Move every dead letter back to pending with a fresh attempt budget
    pub async fn requeue_dead_letters(&self) -> usize {
        let letters: Vec<DeadLetter> = self.dead_letters.lock().await.drain(..).collect();
        let count = letters.len();

        if count > 0 {
            let mut queue = self.queue.lock().await;
            for letter in letters {
                queue.push_back(QueueEntry::new(letter.update));
            }
            tracing::info!(count, "Dead letters requeued");
            self.wake.notify_one();
        }

        count
    }

    /// Remove everything not currently in flight, oldest first
    pub async fn take_pending(&self) -> Vec<QueuedUpdate> {
        let mut queue = self.queue.lock().await;
        let mut taken = Vec::new();
        queue.retain(|entry| {
            if entry.state == UpdateState::InFlight {
                true
            } else {
                taken.push(entry.update.clone());
                false
            }
        });
        taken
    }

    /// Put entries left `InFlight` by an interrupted drain back to pending
    pub async fn release_in_flight(&self) -> usize {
        let mut queue = self.queue.lock().await;
        let mut released = 0;
        for entry in queue.iter_mut().filter(|e| e.state == UpdateState::InFlight) {
            entry.state = UpdateState::Pending;
            released += 1;
        }
        if released > 0 {
            tracing::warn!(released, "Released interrupted in-flight updates");
        }
        released
    }

    /// Stop draining after the current item; the queue itself is kept
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Earliest scheduled retry, if any entry is backing off
    pub async fn next_retry_at(&self) -> Option<Instant> {
        self.queue
            .lock()
            .await
            .iter()
            .filter(|entry| entry.state == UpdateState::Retrying)
            .filter_map(|entry| entry.next_attempt_at)
            .min()
    }

    /// Resolves when something was enqueued or requeued
    pub async fn woken(&self) {
        self.wake.notified().await
    }

    /// Process every due entry once, in FIFO order.
    ///
    /// An entity with an earlier entry still queued blocks later entries for
    /// the same entity, so per-entity submission order is kept across retries.
    /// With `ignore_backoff` every entry counts as due.
    pub async fn drain(&self, ignore_backoff: bool) -> SyncReport {
        let _drain = self.drain_guard.lock().await;
        let mut report = SyncReport::default();
        let mut visited: HashSet<Uuid> = HashSet::new();

        while !self.is_stopping() {
            let Some(update) = self.next_due(ignore_backoff, &visited).await else {
                break;
            };
            visited.insert(update.id);
            let outcome = self.push_resolving(&update).await;
            self.settle(update, outcome, &mut report).await;
        }

        if !report.applied.is_empty() || !report.dead_lettered.is_empty() {
            tracing::info!(
                applied = report.applied.len(),
                retrying = report.retrying.len(),
                dead_lettered = report.dead_lettered.len(),
                "Sync pass finished"
            );
        }

        report
    }

    async fn next_due(&self, ignore_backoff: bool, visited: &HashSet<Uuid>) -> Option<QueuedUpdate> {
        let mut queue = self.queue.lock().await;
        let now = Instant::now();
        let mut blocked: HashSet<String> = HashSet::new();

        for entry in queue.iter_mut() {
            let ids = entry.update.entity_ids();
            let is_blocked = ids.iter().any(|id| blocked.contains(id));
            let due = ignore_backoff || entry.is_due(now);

            if !is_blocked
                && due
                && entry.state != UpdateState::InFlight
                && !visited.contains(&entry.update.id)
            {
                entry.state = UpdateState::InFlight;
                return Some(entry.update.clone());
            }

            blocked.extend(ids);
        }

        None
    }

    async fn settle(
        &self,
        update: QueuedUpdate,
        outcome: Result<Pushed, RemoteError>,
        report: &mut SyncReport,
    ) {
        match outcome {
            Ok(pushed) => {
                self.queue.lock().await.retain(|e| e.update.id != update.id);
                tracing::debug!(update_id = %update.id, target = update.target(), "Update applied");
                self.events.emit_sync(SyncEvent::SyncCompleted {
                    update_id: update.id,
                    entity_ids: update.entity_ids(),
                });
                report.applied.push(update.id);
                report.absorb(pushed);
            }
            Err(error) => {
                let message = error.to_string();
                let mut queue = self.queue.lock().await;
                let Some(index) = queue.iter().position(|e| e.update.id == update.id) else {
                    return;
                };

                let entry = &mut queue[index];
                entry.attempts += 1;
                entry.last_error = Some(message.clone());

                if error.is_transient() && entry.attempts < self.policy.max_attempts {
                    let delay = self.policy.delay(entry.attempts);
                    entry.state = UpdateState::Retrying;
                    entry.next_attempt_at = Some(Instant::now() + delay);
                    tracing::warn!(
                        update_id = %update.id,
                        attempt = entry.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Push failed, retrying"
                    );
                    report.retrying.push(update.id);
                    return;
                }

                let attempts = entry.attempts;
                queue.remove(index);
                drop(queue);

                tracing::error!(update_id = %update.id, attempts, error = %message, "Update dead-lettered");
                self.dead_letters.lock().await.push(DeadLetter {
                    update: update.clone(),
                    attempts,
                    error: message.clone(),
                    failed_at: Utc::now(),
                });
                self.events.emit_sync(SyncEvent::SyncFailed {
                    update_id: Some(update.id),
                    error: message,
                });
                report.dead_lettered.push(update.id);
            }
        }
    }

    /// One attempt outside the queue; used to replay offline operations
    pub async fn push_now(&self, update: &QueuedUpdate) -> Result<Pushed, RemoteError> {
        match self.push_resolving(update).await {
            Ok(pushed) => {
                self.events.emit_sync(SyncEvent::SyncCompleted {
                    update_id: update.id,
                    entity_ids: update.entity_ids(),
                });
                Ok(pushed)
            }
            Err(error) => {
                self.events.emit_sync(SyncEvent::SyncFailed {
                    update_id: Some(update.id),
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Push, and on conflict resolve each contested entity before pushing the
    /// local winners again under the same update id
    async fn push_resolving(&self, update: &QueuedUpdate) -> Result<Pushed, RemoteError> {
        let mut outgoing = update.clone();
        let mut pushed = Pushed::default();

        for _ in 0..MAX_CONFLICT_ROUNDS {
            let remote = match with_timeout(self.timeout, self.remote.push(&outgoing)).await? {
                PushOutcome::Applied => return Ok(pushed),
                PushOutcome::Conflict { remote } => remote,
            };

            let mut next = Vec::with_capacity(outgoing.entities.len());
            for local in outgoing.entities {
                let Some(theirs) = remote.iter().find(|r| r.id == local.id) else {
                    next.push(local);
                    continue;
                };

                pushed.conflicts += 1;
                tracing::info!(entity_id = %local.id, update_id = %update.id, "Conflict detected");
                self.events.emit_sync(SyncEvent::ConflictDetected {
                    entity_id: local.id.clone(),
                });

                let resolution = self.resolver.resolve(&local, theirs);
                if resolution.remote_won {
                    pushed.adopted.push(resolution.winner);
                } else {
                    let mut winner = resolution.winner;
                    if winner.last_updated <= theirs.last_updated {
                        winner.last_updated = theirs.next_timestamp();
                    }
                    next.push(winner);
                }
            }

            if next.is_empty() {
                return Ok(pushed);
            }
            outgoing.entities = next;
        }

        Err(RemoteError::Rejected(format!(
            "conflict on update {} unresolved after {} rounds",
            update.id, MAX_CONFLICT_ROUNDS
        )))
    }
}
