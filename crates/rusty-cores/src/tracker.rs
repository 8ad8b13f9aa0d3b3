// File: rusty-cores/src/tracker.rs
// Purpose: Track live subscriptions and background tasks so leaks can be reported

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// What kind of resource is being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Subscription,
    Task,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Subscription => write!(f, "subscription"),
            ResourceKind::Task => write!(f, "task"),
        }
    }
}

/// A live resource
#[derive(Debug, Clone)]
pub struct TrackedResource {
    pub id: u64,
    pub kind: ResourceKind,
    pub label: String,
    pub created_at: Instant,
}

impl TrackedResource {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    live: BTreeMap<u64, TrackedResource>,
}

/// Registry of live resources; cheap to clone, shared by everything one engine owns
#[derive(Clone, Default)]
pub struct ResourceTracker {
    registry: Arc<Mutex<Registry>>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource; it stays registered until the guard is dropped
    pub fn track(&self, kind: ResourceKind, label: impl Into<String>) -> ResourceGuard {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.live.insert(
            id,
            TrackedResource {
                id,
                kind,
                label: label.into(),
                created_at: Instant::now(),
            },
        );

        ResourceGuard {
            id,
            registry: Arc::clone(&self.registry),
        }
    }

    pub fn outstanding(&self) -> Vec<TrackedResource> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live
            .values()
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        self.outstanding().iter().filter(|r| r.kind == kind).count()
    }

    /// Resources alive for longer than `max_age`
    pub fn detect_leaks(&self, max_age: Duration) -> Vec<TrackedResource> {
        let leaks: Vec<TrackedResource> = self
            .outstanding()
            .into_iter()
            .filter(|r| r.age() > max_age)
            .collect();

        for leak in &leaks {
            tracing::warn!(
                kind = %leak.kind,
                label = %leak.label,
                age_secs = leak.age().as_secs(),
                "Resource outlived its expected lifetime"
            );
        }

        leaks
    }
}

/// Deregisters its resource on drop
#[derive(Debug)]
pub struct ResourceGuard {
    id: u64,
    registry: Arc<Mutex<Registry>>,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live
            .remove(&self.id);
    }
}
