mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use topology_monitor::metrics;
use topology_monitor::DeviceEvent;
use topology_monitor::EntityCache;
use topology_monitor::Host;

#[tokio::test]
async fn test_identical_snapshots_produce_one_event() {
    enable_logger();
    let mut harness = HostHarness::new();
    let id = host_id(1);
    harness.put_host(id, "alpha");
    harness.monitor.start().unwrap();
    assert!(matches!(harness.next_event().await, DeviceEvent::Create { .. }));

    for _ in 0..5 {
        harness.put_host(id, "alpha");
        harness.store.touch(&harness.path(id)).unwrap();
    }
    harness.put_host(id, "beta");
    harness.put_host(id, "beta");

    let events = harness.drain().await;
    let updates: Vec<_> = entity_events(&events, id);
    assert_eq!(updates.len(), 1, "{events:?}");
    assert!(matches!(updates[0], DeviceEvent::Update { entity, .. } if entity.name == "beta"));
    harness.monitor.stop().await;
}

#[tokio::test]
async fn test_malformed_entity_does_not_block_valid_one() {
    enable_logger();
    let mut harness = HostHarness::new();
    let broken = host_id(1);
    let valid = host_id(2);
    harness.store.create(&harness.path(broken), "{ not json").unwrap();
    harness.put_host(valid, "valid");
    harness.monitor.start().unwrap();

    let events = harness.drain().await;
    let broken_events = entity_events(&events, broken);
    assert_eq!(broken_events.len(), 1, "{events:?}");
    assert!(matches!(broken_events[0], DeviceEvent::Unreadable { .. }));

    let valid_events = entity_events(&events, valid);
    assert_eq!(valid_events.len(), 1);
    assert!(matches!(valid_events[0], DeviceEvent::Create { entity, .. } if entity.name == "valid"));
    harness.monitor.stop().await;
}

#[tokio::test]
async fn test_host_lifecycle_end_to_end() {
    enable_logger();
    let mut harness = HostHarness::new();
    let cache: Arc<EntityCache<uuid::Uuid, Host>> = Arc::new(EntityCache::new());
    harness.monitor.subscribe(cache.clone()).unwrap();

    let first = host_id(1);
    let second = host_id(2);
    harness.put_host(first, "first");
    harness.monitor.start().unwrap();
    assert!(matches!(harness.next_event().await, DeviceEvent::Create { id, .. } if id == first));

    harness.put_host(second, "second");
    assert!(matches!(harness.next_event().await, DeviceEvent::Create { id, .. } if id == second));

    harness.put_host(first, "first-renamed");
    match harness.next_event().await {
        DeviceEvent::Update { id, entity } => {
            assert_eq!(id, first);
            assert_eq!(entity.name, "first-renamed");
        }
        other => panic!("expected update, got {other:?}"),
    }

    harness.store.delete(&harness.path(first)).unwrap();
    assert!(matches!(harness.next_event().await, DeviceEvent::Delete { id } if id == first));

    let rest = harness.drain().await;
    assert!(rest.is_empty(), "{rest:?}");

    // removed host is no longer watched, the surviving one is
    assert_eq!(harness.store.data_watch_count(&harness.path(first)), 0);
    assert_eq!(harness.store.data_watch_count(&harness.path(second)), 1);
    assert_eq!(harness.store.child_watch_count(harness.collection()), 1);

    assert_eq!(cache.ids(), vec![second]);
    assert_eq!(cache.get(&second).unwrap().name, "second");

    let exposition = metrics::gather();
    assert!(exposition.contains("monitor_device_events"));
    assert!(exposition.contains(r#"entity_kind="host""#));

    harness.monitor.stop().await;
    assert_eq!(harness.store.data_watch_count(&harness.path(second)), 0);
    assert_eq!(harness.store.child_watch_count(harness.collection()), 0);
}

#[tokio::test]
async fn test_host_without_payload_is_created_once_written() {
    let mut harness = HostHarness::new();
    let id = host_id(7);
    harness.store.create(&harness.path(id), "").unwrap();
    harness.monitor.start().unwrap();
    assert!(harness.drain().await.is_empty());

    harness.store.set_data(&harness.path(id), host_payload("filled")).unwrap();
    assert!(matches!(harness.next_event().await, DeviceEvent::Create { entity, .. } if entity.name == "filled"));
    harness.monitor.stop().await;
}

#[tokio::test]
async fn test_concurrent_stops_complete() {
    let mut harness = HostHarness::new();
    for n in 0..10 {
        harness.put_host(host_id(n), "bulk");
    }
    harness.monitor.start().unwrap();
    let _ = harness.next_event().await;

    tokio::time::timeout(Duration::from_secs(2), async {
        tokio::join!(harness.monitor.stop(), harness.monitor.stop());
    })
    .await
    .expect("stop should complete");
    assert!(!harness.monitor.is_running());
}
