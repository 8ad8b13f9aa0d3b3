// Integration tests for sync, retry, offline replay and conflict handling

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{calm, eventually, focus, harness, harness_with, init_tracing, test_config};
use pretty_assertions::assert_eq;
use rusty_cores::{
    CacheStore, Collaborators, CoreUpdateKind, FilesystemCache, MemoryRemote, OfflineQueue,
    RecoveryAction, RemoteError, StateContainer, SyncEvent, Trend, UpdateCause, VersionedEntity,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

fn count_sync(events: &[SyncEvent], matches: impl Fn(&SyncEvent) -> bool) -> usize {
    events.iter().filter(|e| matches(e)).count()
}

#[tokio::test]
async fn test_online_update_reaches_remote() {
    let h = harness(vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();
    let mut sync = h.container.subscribe_sync_events();

    h.container.update(focus(50.0).with_value(62.0), None).await.unwrap();

    let remote = h.remote.clone();
    assert!(eventually(|| {
        let remote = remote.clone();
        async move { remote.entity("a").await.map(|e| e.value) == Some(62.0) }
    })
    .await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let events = sync.drain();
    assert!(matches!(events[0], SyncEvent::UpdateQueued { queue_size: 1 }));
    assert_eq!(count_sync(&events, |e| matches!(e, SyncEvent::SyncCompleted { .. })), 1);
    assert_eq!(h.container.pending_sync().await, 0);

    h.container.dispose().await;
}

#[tokio::test]
async fn test_two_failures_then_success_completes_once() {
    let h = harness(vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();
    h.remote.fail_next(2, RemoteError::Network("flaky".into())).await;
    let mut sync = h.container.subscribe_sync_events();

    h.container.update(focus(50.0).with_value(62.0), None).await.unwrap();
    for _ in 0..5 {
        if h.container.pending_sync().await == 0 {
            break;
        }
        h.container.force_sync().await.unwrap();
    }

    assert_eq!(h.container.pending_sync().await, 0);
    assert_eq!(h.remote.push_count().await, 3);
    assert!(h.container.dead_letters().await.is_empty());
    assert_eq!(h.remote.entity("a").await.unwrap().value, 62.0);

    let events = sync.drain();
    assert_eq!(count_sync(&events, |e| matches!(e, SyncEvent::SyncCompleted { .. })), 1);
    assert_eq!(count_sync(&events, |e| matches!(e, SyncEvent::SyncFailed { .. })), 0);

    h.container.dispose().await;
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_and_retry_recovers() {
    let h = harness(vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();
    h.remote.fail_next(3, RemoteError::Network("down".into())).await;
    let mut sync = h.container.subscribe_sync_events();

    h.container.update(focus(50.0).with_value(62.0), None).await.unwrap();
    for _ in 0..5 {
        if h.container.pending_sync().await == 0 {
            break;
        }
        h.container.force_sync().await.unwrap();
    }

    let letters = h.container.dead_letters().await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 3);
    assert!(letters[0].error.contains("down"));
    assert_eq!(h.remote.entity("a").await.unwrap().value, 50.0);
    assert_eq!(
        count_sync(&sync.drain(), |e| matches!(e, SyncEvent::SyncFailed { update_id: Some(_), .. })),
        1
    );

    h.container.recover(RecoveryAction::Retry).await.unwrap();
    assert!(h.container.dead_letters().await.is_empty());
    assert_eq!(h.remote.entity("a").await.unwrap().value, 62.0);

    h.container.dispose().await;
}

#[tokio::test]
async fn test_force_sync_offline_is_network_error() {
    let h = harness(vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();
    h.online.send(false).unwrap();

    let err = h.container.force_sync().await.unwrap_err();
    assert!(err.recovery_actions().contains(&RecoveryAction::ForceSync));

    h.container.dispose().await;
}

#[tokio::test]
async fn test_offline_updates_are_replayed_on_reconnect() {
    let h = harness(vec![focus(50.0), calm(40.0)], true).await;
    h.container.initialize().await.unwrap();
    h.online.send(false).unwrap();

    h.container.update(focus(50.0).with_value(55.0), None).await.unwrap();
    h.container.update(focus(50.0).with_value(62.0), None).await.unwrap();
    h.container.update(calm(40.0).with_value(30.0), None).await.unwrap();

    // Reads keep working and the remote has seen nothing
    assert_eq!(h.container.get_by_id("a").unwrap().value, 62.0);
    assert_eq!(h.container.pending_offline().await.unwrap(), 3);
    assert_eq!(h.remote.push_count().await, 0);

    h.online.send(true).unwrap();
    let offline = h.offline.clone();
    assert!(eventually(|| {
        let offline = offline.clone();
        async move { offline.is_empty().await.unwrap() }
    })
    .await);

    assert_eq!(h.remote.entity("a").await.unwrap().value, 62.0);
    assert_eq!(h.remote.entity("b").await.unwrap().value, 30.0);
    assert_eq!(h.remote.push_count().await, 3);

    h.container.dispose().await;
}

#[tokio::test]
async fn test_failed_replay_keeps_operation_queued() {
    let h = harness(vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();
    h.online.send(false).unwrap();
    h.container.update(focus(50.0).with_value(62.0), None).await.unwrap();

    h.remote.fail_next(1, RemoteError::Network("still down".into())).await;
    h.online.send(true).unwrap();

    let offline = h.offline.clone();
    assert!(eventually(|| {
        let offline = offline.clone();
        async move {
            offline
                .pending()
                .await
                .unwrap()
                .first()
                .map_or(false, |op| op.attempts == 1)
        }
    })
    .await);

    let pending = h.offline.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].last_error.as_deref().unwrap().contains("still down"));

    // The next explicit sync replays it
    h.container.force_sync().await.unwrap();
    assert!(h.offline.is_empty().await.unwrap());
    assert_eq!(h.remote.entity("a").await.unwrap().value, 62.0);

    h.container.dispose().await;
}

#[tokio::test]
async fn test_offline_conflict_converges_to_newer_remote() {
    let h = harness(vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();
    h.online.send(false).unwrap();

    let cause = UpdateCause::new("journal").with_cause_id("entry-1");
    let local = h
        .container
        .update(focus(50.0).with_value(62.0), Some(cause))
        .await
        .unwrap();
    assert_eq!(h.container.pending_offline().await.unwrap(), 1);

    // Another device wrote 70 after us
    let mut theirs = local.with_value(70.0);
    theirs.trend = Trend::Rising;
    theirs.last_updated = local.last_updated + ChronoDuration::seconds(5);
    h.remote.set_entity(theirs.clone()).await;

    let mut updates = h.container.subscribe_core_updates();
    let mut sync = h.container.subscribe_sync_events();
    h.online.send(true).unwrap();

    let container = h.container.clone();
    assert!(eventually(|| {
        let container = container.clone();
        async move { container.get_by_id("a").map(|e| e.value) == Some(70.0) }
    })
    .await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.container.get_by_id("a").unwrap(), theirs);
    assert_eq!(h.remote.entity("a").await.unwrap(), theirs);
    assert!(h.offline.is_empty().await.unwrap());

    let kinds: Vec<CoreUpdateKind> = updates.drain().into_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![CoreUpdateKind::LevelChanged { previous: 62.0, current: 70.0 }]
    );
    assert_eq!(
        count_sync(&sync.drain(), |e| matches!(e, SyncEvent::ConflictDetected { entity_id } if entity_id == "a")),
        1
    );

    h.container.dispose().await;
}

#[tokio::test]
async fn test_disconnect_moves_unsynced_updates_to_offline_queue() {
    let h = harness(vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();
    h.remote.fail_next(1, RemoteError::Network("flaky".into())).await;

    h.container.update(focus(50.0).with_value(62.0), None).await.unwrap();
    let container = h.container.clone();
    let remote = h.remote.clone();
    assert!(eventually(|| {
        let remote = remote.clone();
        async move { remote.push_count().await == 1 }
    })
    .await);
    assert_eq!(container.pending_sync().await, 1);

    h.online.send(false).unwrap();
    let offline = h.offline.clone();
    assert!(eventually(|| {
        let offline = offline.clone();
        async move { offline.len().await.unwrap() == 1 }
    })
    .await);
    assert_eq!(h.container.pending_sync().await, 0);

    h.container.dispose().await;
}

#[tokio::test]
async fn test_heartbeat_pulls_remote_changes() {
    init_tracing();
    let mut config = test_config();
    config.sync.interval_secs = 1;
    let remote = MemoryRemote::with_entities(vec![focus(50.0)]).await;
    let (_online, connectivity) = watch::channel(true);
    let container = StateContainer::new(
        config,
        Collaborators {
            remote: Arc::new(remote.clone()),
            cache: Arc::new(rusty_cores::MemoryCache::new()),
            offline: OfflineQueue::in_memory().await.unwrap(),
            connectivity,
        },
    );
    container.initialize().await.unwrap();

    let newer = focus(75.0).with_last_updated(Utc::now() + ChronoDuration::seconds(5));
    remote.set_entity(newer).await;

    let probe = container.clone();
    let pulled = async {
        for _ in 0..40 {
            if probe.get_by_id("a").map(|e| e.value) == Some(75.0) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    };
    assert!(pulled.await);

    container.dispose().await;
}

#[tokio::test]
async fn test_offline_queue_survives_restart() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("offline.db").display());
    let cache_dir = dir.path().join("cache");
    let remote = MemoryRemote::with_entities(vec![focus(50.0)]).await;

    let open = |connected: bool| {
        let url = url.clone();
        let cache_dir = cache_dir.clone();
        let remote = remote.clone();
        async move {
            let (online, connectivity) = watch::channel(connected);
            let cache: Arc<dyn CacheStore> = Arc::new(FilesystemCache::new(cache_dir).await.unwrap());
            let container = StateContainer::new(
                test_config(),
                Collaborators {
                    remote: Arc::new(remote),
                    cache,
                    offline: OfflineQueue::open(&url).await.unwrap(),
                    connectivity,
                },
            );
            (container, online)
        }
    };

    {
        let (container, online) = open(true).await;
        container.initialize().await.unwrap();
        online.send(false).unwrap();
        container.update(focus(50.0).with_value(55.0), None).await.unwrap();
        container.update(focus(50.0).with_value(62.0), None).await.unwrap();
        assert_eq!(container.pending_offline().await.unwrap(), 2);
        container.dispose().await;
    }

    let (container, online) = open(false).await;
    container.initialize().await.unwrap();
    assert_eq!(container.get_by_id("a").unwrap().value, 62.0);
    assert_eq!(container.pending_offline().await.unwrap(), 2);
    assert_eq!(remote.push_count().await, 0);

    online.send(true).unwrap();
    let probe = container.clone();
    assert!(eventually(|| {
        let probe = probe.clone();
        async move { probe.pending_offline().await.unwrap() == 0 }
    })
    .await);
    // Replayed oldest first, so the later write is the one that sticks
    assert_eq!(remote.entity("a").await.unwrap().value, 62.0);
    assert_eq!(remote.push_count().await, 2);
    assert_eq!(container.get_by_id("a").unwrap().value, 62.0);

    container.dispose().await;
}

#[tokio::test]
async fn test_dispose_persists_updates_stuck_in_slow_pushes() {
    let mut config = test_config();
    config.sync.remote_timeout_ms = 200;
    let clarity = VersionedEntity::new("c", "Clarity", 10.0);
    let h = harness_with(config, vec![focus(50.0), calm(40.0), clarity.clone()], true).await;
    h.container.initialize().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.remote.set_latency(Some(Duration::from_secs(5))).await;

    h.container.update(focus(50.0).with_value(62.0), None).await.unwrap();
    h.container.update(calm(40.0).with_value(30.0), None).await.unwrap();
    h.container.update(clarity.with_value(20.0), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    h.container.dispose().await;

    assert_eq!(h.container.pending_sync().await, 0);
    let persisted: Vec<String> = h
        .offline
        .pending()
        .await
        .unwrap()
        .into_iter()
        .flat_map(|op| op.data.entities.into_iter().map(|e| e.id))
        .collect();
    assert_eq!(persisted, vec!["a", "b", "c"]);
}
