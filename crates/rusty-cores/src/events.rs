// File: rusty-cores/src/events.rs
// Purpose: In-process broadcast of core updates and sync status

use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;

use crate::models::{CoreUpdateEvent, SyncEvent};
use crate::tracker::{ResourceGuard, ResourceKind, ResourceTracker};

/// A tracked receiver. Dropping it releases the subscription.
pub struct Subscription<T: Clone> {
    rx: broadcast::Receiver<T>,
    _guard: ResourceGuard,
}

impl<T: Clone> Subscription<T> {
    pub(crate) fn new(rx: broadcast::Receiver<T>, guard: ResourceGuard) -> Self {
        Self { rx, _guard: guard }
    }

    /// Next event in emission order, `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Subscriber fell behind, oldest events were dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-delivered event, without waiting
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Subscriber fell behind, oldest events were dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Everything delivered so far
    pub fn drain(&mut self) -> Vec<T> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Explicitly release the subscription
    pub fn release(self) {}
}

/// A callback subscriber running on its own task
pub struct Listener {
    handle: JoinHandle<()>,
}

impl Listener {
    /// Stop the listener and release its subscription
    pub fn release(self) {}

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Publish/subscribe hub with one channel per event type
#[derive(Clone)]
pub struct EventBus {
    core_tx: broadcast::Sender<CoreUpdateEvent>,
    sync_tx: broadcast::Sender<SyncEvent>,
    tracker: ResourceTracker,
}

impl EventBus {
    pub fn new(capacity: usize, tracker: ResourceTracker) -> Self {
        let capacity = capacity.max(1);
        let (core_tx, _) = broadcast::channel(capacity);
        let (sync_tx, _) = broadcast::channel(capacity);

        Self {
            core_tx,
            sync_tx,
            tracker,
        }
    }

    /// Publish a core update; having no subscribers is not an error
    pub fn emit_core(&self, event: CoreUpdateEvent) {
        tracing::debug!(entity_id = %event.entity_id, kind = ?event.kind, "Core update");
        let _ = self.core_tx.send(event);
    }

    pub fn emit_sync(&self, event: SyncEvent) {
        tracing::debug!(event = ?event, "Sync event");
        let _ = self.sync_tx.send(event);
    }

    pub fn subscribe_core(&self) -> Subscription<CoreUpdateEvent> {
        Subscription::new(
            self.core_tx.subscribe(),
            self.tracker.track(ResourceKind::Subscription, "core-updates"),
        )
    }

    pub fn subscribe_sync(&self) -> Subscription<SyncEvent> {
        Subscription::new(
            self.sync_tx.subscribe(),
            self.tracker.track(ResourceKind::Subscription, "sync-events"),
        )
    }

    /// Call `handler` for every core update. A panicking handler is logged and keeps listening.
    pub fn on_core_update<F>(&self, handler: F) -> Listener
    where
        F: Fn(&CoreUpdateEvent) + Send + Sync + 'static,
    {
        spawn_listener(self.subscribe_core(), "core-updates", handler)
    }

    /// Call `handler` for every sync event. A panicking handler is logged and keeps listening.
    pub fn on_sync_event<F>(&self, handler: F) -> Listener
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        spawn_listener(self.subscribe_sync(), "sync-events", handler)
    }

    pub fn core_subscriber_count(&self) -> usize {
        self.core_tx.receiver_count()
    }
}

fn spawn_listener<T, F>(mut subscription: Subscription<T>, channel: &'static str, handler: F) -> Listener
where
    T: Clone + Send + 'static,
    F: Fn(&T) + Send + Sync + 'static,
{
    let handle = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::error!(channel, "Event listener panicked; event skipped for this listener");
            }
        }
    });

    Listener { handle }
}
