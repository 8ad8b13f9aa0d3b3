// Integration tests for the state container's read/update surface

mod common;

use chrono::Duration as ChronoDuration;
use common::{calm, focus, harness, harness_with, test_config};
use pretty_assertions::assert_eq;
use rstest::rstest;
use rusty_cores::{
    CoreUpdateKind, EngineError, ErrorKind, RecoveryAction, ResourceKind, Trend, UpdateCause,
};
use std::time::Duration;

#[tokio::test]
async fn test_initialize_loads_from_remote_when_cache_is_empty() {
    let h = harness(vec![calm(20.0), focus(50.0)], true).await;
    h.container.initialize().await.unwrap();

    let ids: Vec<String> = h.container.get_all().into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(h.container.get_by_id("a").unwrap().value, 50.0);
    assert!(h.container.get_by_id("missing").is_none());

    h.container.dispose().await;
}

#[tokio::test]
async fn test_initialize_offline_without_cache_is_recoverable() {
    let h = harness(vec![focus(50.0)], false).await;

    let err = h.container.initialize().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NetworkError);
    assert!(err.is_recoverable());
    assert_eq!(h.container.last_error(), Some(err));
    assert!(h.container.get_all().is_empty());

    h.online.send(true).unwrap();
    let container = h.container.clone();
    assert!(common::eventually(|| {
        let container = container.clone();
        async move { container.get_by_id("a").is_some() }
    })
    .await);

    h.container.dispose().await;
}

#[rstest]
#[case(-1.0)]
#[case(100.01)]
#[case(f64::INFINITY)]
#[tokio::test]
async fn test_update_rejects_out_of_bounds(#[case] value: f64) {
    let h = harness(vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();
    let mut updates = h.container.subscribe_core_updates();

    let err = h
        .container
        .update(focus(50.0).with_value(value), None)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Validation(_)));
    assert!(err.recovery_actions().is_empty());
    assert_eq!(h.container.get_by_id("a").unwrap().value, 50.0);
    assert!(updates.drain().is_empty());

    h.container.dispose().await;
}

#[tokio::test]
async fn test_update_unknown_core_is_navigation_error() {
    let h = harness(vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();

    let err = h.container.update(calm(10.0), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NavigationError);

    h.container.dispose().await;
}

#[tokio::test]
async fn test_update_derives_trend_and_emits_one_event_per_change() {
    let h = harness(vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();
    let before = h.container.get_by_id("a").unwrap();
    let mut updates = h.container.subscribe_core_updates();

    let cause = UpdateCause::new("journal").with_cause_id("entry-1");
    let stored = h
        .container
        .update(before.with_value(62.0), Some(cause))
        .await
        .unwrap();

    assert_eq!(stored.trend, Trend::Rising);
    assert!(stored.last_updated > before.last_updated);
    assert!(stored.milestone("m60").unwrap().achieved);
    assert_eq!(h.container.get_by_id("a").unwrap(), stored);

    let events = updates.drain();
    let kinds: Vec<CoreUpdateKind> = events.iter().map(|e| e.kind.clone()).collect();
    assert_eq!(
        kinds,
        vec![
            CoreUpdateKind::LevelChanged { previous: 50.0, current: 62.0 },
            CoreUpdateKind::TrendChanged { previous: Trend::Stable, current: Trend::Rising },
            CoreUpdateKind::MilestoneAchieved { milestone_id: "m60".into(), threshold: 60.0 },
        ]
    );
    assert!(events.iter().all(|e| e.cause_id.as_deref() == Some("entry-1")));
    assert!(events.iter().all(|e| e.source == "journal"));

    // Same value again: only the trend moves back to stable
    h.container.update(stored.with_value(62.0), None).await.unwrap();
    let kinds: Vec<CoreUpdateKind> = updates.drain().into_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![CoreUpdateKind::TrendChanged { previous: Trend::Rising, current: Trend::Stable }]
    );

    h.container.dispose().await;
}

#[tokio::test]
async fn test_incoming_trend_is_ignored() {
    let h = harness(vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();

    let mut incoming = focus(50.0).with_value(40.0);
    incoming.trend = Trend::Rising;
    let stored = h.container.update(incoming, None).await.unwrap();

    assert_eq!(stored.trend, Trend::Declining);
    h.container.dispose().await;
}

#[tokio::test]
async fn test_achieved_milestone_never_reverts() {
    let h = harness(vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();

    let achieved = h.container.update(focus(50.0).with_value(65.0), None).await.unwrap();
    assert!(achieved.milestone("m60").unwrap().achieved);

    let mut regress = achieved.with_value(10.0);
    regress.milestones[0].achieved = false;
    let stored = h.container.update(regress, None).await.unwrap();

    assert_eq!(stored.value, 10.0);
    assert!(stored.milestone("m60").unwrap().achieved);
    h.container.dispose().await;
}

#[tokio::test]
async fn test_concurrent_updates_do_not_interleave() {
    let h = harness(vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();
    let mut updates = h.container.subscribe_core_updates();

    let (first, second) = tokio::join!(
        h.container.update(focus(50.0).with_value(60.0), None),
        h.container.update(focus(50.0).with_value(70.0), None),
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert_ne!(first.last_updated, second.last_updated);

    let levels: Vec<(f64, f64)> = updates
        .drain()
        .into_iter()
        .filter_map(|e| match e.kind {
            CoreUpdateKind::LevelChanged { previous, current } => Some((previous, current)),
            _ => None,
        })
        .collect();

    assert_eq!(levels.len(), 2);
    assert_eq!(levels[0].0, 50.0);
    assert_eq!(levels[1].0, levels[0].1);

    let stored = h.container.get_by_id("a").unwrap();
    assert_eq!(stored.value, levels[1].1);
    assert_eq!(stored.last_updated, first.last_updated.max(second.last_updated));

    h.container.dispose().await;
}

#[tokio::test]
async fn test_batch_update_emits_per_core_events_then_batch_event() {
    let h = harness(vec![focus(50.0), calm(40.0)], true).await;
    h.container.initialize().await.unwrap();
    let mut updates = h.container.subscribe_core_updates();

    let stored = h
        .container
        .batch_update(vec![focus(50.0).with_value(62.0), calm(40.0).with_value(30.0)], None)
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].trend, Trend::Declining);

    let events = updates.drain();
    let targets: Vec<&str> = events.iter().map(|e| e.entity_id.as_str()).collect();
    assert_eq!(targets, vec!["a", "a", "a", "b", "b", "batch"]);
    assert_eq!(
        events.last().unwrap().kind,
        CoreUpdateKind::BatchUpdate { entity_ids: vec!["a".into(), "b".into()] }
    );

    let remote = h.remote.clone();
    assert!(common::eventually(|| {
        let remote = remote.clone();
        async move { remote.entity("b").await.map(|e| e.value) == Some(30.0) }
    })
    .await);

    h.container.dispose().await;
}

#[tokio::test]
async fn test_batch_update_is_all_or_nothing() {
    let h = harness(vec![focus(50.0), calm(40.0)], true).await;
    h.container.initialize().await.unwrap();

    let err = h
        .container
        .batch_update(vec![focus(50.0).with_value(62.0), calm(40.0).with_value(150.0)], None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert_eq!(h.container.get_by_id("a").unwrap().value, 50.0);
    assert_eq!(h.container.pending_sync().await, 0);
    h.container.dispose().await;
}

#[tokio::test]
async fn test_rapid_updates_are_coalesced_into_fewer_notifications() {
    let h = harness(vec![focus(0.0)], true).await;
    h.container.initialize().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut changes = h.container.subscribe_changes();

    for value in 1..=10 {
        h.container
            .update(focus(0.0).with_value(value as f64 * 5.0), None)
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(250)).await;

    let emitted = changes.drain();
    assert!(!emitted.is_empty());
    assert!(emitted.len() < 10, "got {} notifications", emitted.len());
    let last = emitted.last().unwrap();
    assert_eq!(last.entities[0].value, 50.0);

    h.container.dispose().await;
}

#[tokio::test]
async fn test_refresh_force_pulls_newer_remote_copy() {
    let h = harness(vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();
    let mut updates = h.container.subscribe_core_updates();

    let mut newer = focus(80.0).with_last_updated(chrono::Utc::now() + ChronoDuration::seconds(5));
    newer.trend = Trend::Rising;
    h.remote.set_entity(newer.clone()).await;

    h.container.refresh(true).await.unwrap();
    assert_eq!(h.container.get_by_id("a").unwrap(), newer);
    let events = updates.drain();
    assert!(events.iter().all(|e| e.source == "remote"));
    assert!(matches!(events[0].kind, CoreUpdateKind::LevelChanged { current, .. } if current == 80.0));

    // Cache path keeps the newer in-memory copy
    h.container.refresh(false).await.unwrap();
    assert_eq!(h.container.get_by_id("a").unwrap(), newer);
    assert!(h.container.cache_stats().hits > 0);

    h.container.dispose().await;
}

#[tokio::test]
async fn test_refresh_times_out_as_network_error() {
    let h = harness(vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();
    h.remote.set_latency(Some(Duration::from_secs(2))).await;

    let err = h.container.refresh(true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NetworkError);
    assert!(err.to_string().contains("timed out"));
    assert_eq!(h.container.get_by_id("a").unwrap().value, 50.0);

    h.remote.set_latency(None).await;
    h.container.dispose().await;
}

#[tokio::test]
async fn test_resolve_core_conflicts_keeps_newest() {
    let h = harness(vec![focus(50.0), calm(40.0)], true).await;
    h.container.initialize().await.unwrap();
    let local_b = h.container.get_by_id("b").unwrap();

    let older_a = focus(10.0).with_last_updated(chrono::Utc::now() - ChronoDuration::hours(1));
    let newer_b = calm(90.0).with_last_updated(local_b.last_updated + ChronoDuration::seconds(1));

    let resolved = h
        .container
        .resolve_core_conflicts(vec![older_a, newer_b.clone()])
        .await
        .unwrap();

    assert_eq!(resolved[0].value, 50.0);
    assert_eq!(resolved[1], newer_b);
    assert_eq!(h.container.get_by_id("a").unwrap().value, 50.0);
    assert_eq!(h.container.get_by_id("b").unwrap(), newer_b);

    h.container.dispose().await;
}

#[tokio::test]
async fn test_entity_context_round_trip() {
    let h = harness(vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();

    assert_eq!(h.container.entity_context("a").await.unwrap(), None);
    h.container
        .put_entity_context("a", serde_json::json!({"label": "steady"}))
        .await
        .unwrap();
    let context = h.container.entity_context("a").await.unwrap().unwrap();
    assert_eq!(context.data["label"], "steady");

    // A mutation invalidates derived context
    h.container.update(focus(50.0).with_value(55.0), None).await.unwrap();
    assert_eq!(h.container.entity_context("a").await.unwrap(), None);

    let err = h.container.entity_context("zzz").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NavigationError);

    h.container.dispose().await;
}

#[tokio::test]
async fn test_clear_cache_recovery_rewrites_from_memory() {
    let h = harness(vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();
    h.container.update(focus(50.0).with_value(55.0), None).await.unwrap();

    h.container.recover(RecoveryAction::ClearCache).await.unwrap();
    assert_eq!(h.container.cache_stats().invalidations, 0);
    assert!(h.container.last_error().is_none());

    h.container.refresh(false).await.unwrap();
    assert_eq!(h.container.get_by_id("a").unwrap().value, 55.0);

    h.container.dispose().await;
}

#[tokio::test]
async fn test_dispose_releases_background_work() {
    let h = harness(vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();
    let held = h.container.subscribe_core_updates();

    assert_eq!(
        h.container
            .outstanding_resources()
            .iter()
            .filter(|r| r.kind == ResourceKind::Task)
            .count(),
        2
    );
    assert!(h.container.detect_leaks().is_empty());

    h.container.dispose().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let outstanding = h.container.outstanding_resources();
    assert_eq!(outstanding.len(), 1);
    assert_eq!(outstanding[0].kind, ResourceKind::Subscription);

    let err = h.container.update(focus(50.0).with_value(55.0), None).await.unwrap_err();
    assert_eq!(err, EngineError::ShutDown);

    drop(held);
    assert!(h.container.outstanding_resources().is_empty());
}

#[tokio::test]
async fn test_detect_leaks_reports_forgotten_subscriptions() {
    let mut config = test_config();
    config.diagnostics.max_resource_age_secs = 0;
    let h = harness_with(config, vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();

    let _forgotten = h.container.subscribe_sync_events();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let leaks = h.container.detect_leaks();
    assert!(leaks.iter().any(|r| r.label == "sync-events"));

    h.container.dispose().await;
}

#[tokio::test]
async fn test_zero_capacity_and_interval_are_clamped() {
    let mut config = test_config();
    config.events.channel_capacity = 0;
    config.sync.interval_secs = 0;
    let h = harness_with(config, vec![focus(50.0)], true).await;
    h.container.initialize().await.unwrap();

    let mut updates = h.container.subscribe_core_updates();
    h.container.update(focus(50.0).with_value(62.0), None).await.unwrap();
    // A one-slot channel may skip to the newest event, but never panics
    assert_eq!(updates.recv().await.map(|e| e.entity_id), Some("a".to_string()));

    // The heartbeat still runs and pulls newer remote state
    let newer = focus(75.0).with_last_updated(chrono::Utc::now() + ChronoDuration::seconds(5));
    h.remote.set_entity(newer).await;
    let mut pulled = false;
    for _ in 0..60 {
        if h.container.get_by_id("a").map(|e| e.value) == Some(75.0) {
            pulled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(pulled);

    h.container.dispose().await;
}
