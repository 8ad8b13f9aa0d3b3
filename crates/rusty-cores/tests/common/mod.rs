// Shared fixtures for the integration tests
#![allow(dead_code)]

use rusty_cores::{
    CacheStore, Collaborators, EngineConfig, MemoryCache, MemoryRemote, Milestone, OfflineQueue,
    StateContainer, VersionedEntity,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Config with background timers pushed out of the way and no jitter
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.sync.interval_secs = 3_600;
    config.sync.base_delay_ms = 60_000;
    config.sync.max_jitter_ms = 0;
    config.sync.remote_timeout_ms = 500;
    config.notify.min_interval_ms = 50;
    config
}

pub fn focus(value: f64) -> VersionedEntity {
    VersionedEntity::new("a", "Focus", value).with_milestone(Milestone::new("m60", 60.0))
}

pub fn calm(value: f64) -> VersionedEntity {
    VersionedEntity::new("b", "Calm", value)
}

pub struct Harness {
    pub container: StateContainer,
    pub remote: MemoryRemote,
    pub online: watch::Sender<bool>,
    pub offline: OfflineQueue,
}

pub async fn harness(seed: Vec<VersionedEntity>, connected: bool) -> Harness {
    harness_with(test_config(), seed, connected).await
}

pub async fn harness_with(
    config: EngineConfig,
    seed: Vec<VersionedEntity>,
    connected: bool,
) -> Harness {
    init_tracing();
    let remote = MemoryRemote::with_entities(seed).await;
    let offline = OfflineQueue::in_memory().await.unwrap();
    let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
    let (online, connectivity) = watch::channel(connected);

    let container = StateContainer::new(
        config,
        Collaborators {
            remote: Arc::new(remote.clone()),
            cache,
            offline: offline.clone(),
            connectivity,
        },
    );

    Harness {
        container,
        remote,
        online,
        offline,
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
