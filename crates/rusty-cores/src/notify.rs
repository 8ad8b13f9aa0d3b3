// File: rusty-cores/src/notify.rs
// Purpose: Throttled "state changed" signal for observers

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::events::Subscription;
use crate::models::VersionedEntity;
use crate::tracker::{ResourceKind, ResourceTracker};

/// Snapshot delivered to observers after one or more coalesced changes
#[derive(Debug, Clone, PartialEq)]
pub struct StateChanged {
    /// Number of signals received so far; gaps mean signals were coalesced
    pub revision: u64,
    pub entities: Vec<VersionedEntity>,
    pub emitted_at: DateTime<Utc>,
}

/// Rate-limits change signals to at most one emission per `min_interval`.
///
/// The first signal after a quiet period is emitted immediately. Signals that
/// arrive inside the window are folded into a single trailing emission once
/// the window closes, so the latest state is always delivered.
pub struct ChangeNotifier {
    trigger: Arc<Notify>,
    revision: Arc<AtomicU64>,
    tx: broadcast::Sender<StateChanged>,
    min_interval: Duration,
    tracker: ResourceTracker,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeNotifier {
    pub fn new(min_interval: Duration, capacity: usize, tracker: ResourceTracker) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));

        Self {
            trigger: Arc::new(Notify::new()),
            revision: Arc::new(AtomicU64::new(0)),
            tx,
            min_interval,
            tracker,
            handle: Mutex::new(None),
        }
    }

    /// Start the emitting task. `snapshot` is read at emission time.
    pub fn start<F>(&self, snapshot: F)
    where
        F: Fn() -> Vec<VersionedEntity> + Send + Sync + 'static,
    {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return;
        }

        let trigger = Arc::clone(&self.trigger);
        let revision = Arc::clone(&self.revision);
        let tx = self.tx.clone();
        let min_interval = self.min_interval;
        let guard = self.tracker.track(ResourceKind::Task, "change-notifier");

        *handle = Some(tokio::spawn(async move {
            let _guard = guard;
            let mut last_emit: Option<Instant> = None;
            let mut last_revision = 0;

            loop {
                trigger.notified().await;

                if let Some(last) = last_emit {
                    let due = last + min_interval;
                    if Instant::now() < due {
                        tokio::time::sleep_until(due).await;
                    }
                }

                let current = revision.load(Ordering::SeqCst);
                if current == last_revision {
                    continue;
                }

                let _ = tx.send(StateChanged {
                    revision: current,
                    entities: snapshot(),
                    emitted_at: Utc::now(),
                });
                tracing::trace!(revision = current, "State change emitted");

                last_revision = current;
                last_emit = Some(Instant::now());
            }
        }));
    }

    /// Record a change; emission happens on the notifier task
    pub fn signal(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
        self.trigger.notify_one();
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> Subscription<StateChanged> {
        Subscription::new(
            self.tx.subscribe(),
            self.tracker.track(ResourceKind::Subscription, "state-changes"),
        )
    }

    /// Stop the emitting task; pending signals are dropped
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for ChangeNotifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}
