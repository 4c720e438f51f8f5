use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::*;
use crate::test_utils::*;
use crate::Error;
use crate::HostKind;
use crate::HostMonitor;
use crate::MonitorError;

fn host_monitor() -> (Arc<crate::MemoryCoordinationStore>, HostMonitor) {
    let (store, client, config, _) = host_fixture();
    (store, HostMonitor::for_hosts(client, config))
}

fn subscribe(monitor: &HostMonitor) -> mpsc::UnboundedReceiver<HostEvent> {
    let (subscriber, events) = ChannelSubscriber::new();
    monitor.subscribe(subscriber).unwrap();
    events
}

fn created_name(event: HostEvent) -> String {
    match event {
        DeviceEvent::Create { entity, .. } => entity.name.clone(),
        other => panic!("expected create, got {other:?}"),
    }
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let (_store, monitor) = host_monitor();
    monitor.start().unwrap();
    assert!(monitor.is_running());
    assert!(matches!(
        monitor.start(),
        Err(Error::Monitor(MonitorError::AlreadyStarted("host")))
    ));
    monitor.stop().await;
}

#[tokio::test]
async fn test_stopped_monitor_rejects_start_and_subscribe() {
    let (_store, monitor) = host_monitor();
    monitor.start().unwrap();
    monitor.stop().await;
    monitor.stop().await;

    assert!(!monitor.is_running());
    assert!(matches!(monitor.start(), Err(Error::Monitor(MonitorError::Stopped("host")))));
    let (subscriber, _events) = ChannelSubscriber::new();
    assert!(matches!(
        monitor.subscribe(subscriber),
        Err(Error::Monitor(MonitorError::Stopped("host")))
    ));
}

#[tokio::test]
async fn test_stop_before_start_is_allowed() {
    let (_store, monitor) = host_monitor();
    let _events = subscribe(&monitor);
    monitor.stop().await;
    assert_eq!(monitor.subscriber_count(), 0);
    assert!(monitor.start().is_err());
}

#[tokio::test]
async fn test_existing_entities_are_created_then_updated_and_deleted() {
    enable_logger();
    let (store, monitor) = host_monitor();
    let id = host_id(1);
    store.create(&host_path(id), host_payload("alpha")).unwrap();

    let mut events = subscribe(&monitor);
    monitor.start().unwrap();
    assert_eq!(created_name(recv_within(&mut events).await), "alpha");

    store.set_data(&host_path(id), host_payload("beta")).unwrap();
    match recv_within(&mut events).await {
        DeviceEvent::Update { id: updated, entity } => {
            assert_eq!(updated, id);
            assert_eq!(entity.name, "beta");
        }
        other => panic!("expected update, got {other:?}"),
    }

    store.delete(&host_path(id)).unwrap();
    assert!(matches!(recv_within(&mut events).await, DeviceEvent::Delete { id: deleted } if deleted == id));
    assert_quiet(&mut events).await;
    monitor.stop().await;
}

#[tokio::test]
async fn test_recreated_entity_gets_a_fresh_create() {
    let (store, monitor) = host_monitor();
    let id = host_id(1);
    store.create(&host_path(id), host_payload("first")).unwrap();
    let mut events = subscribe(&monitor);
    monitor.start().unwrap();
    recv_within(&mut events).await;

    store.delete(&host_path(id)).unwrap();
    assert!(matches!(recv_within(&mut events).await, DeviceEvent::Delete { .. }));

    store.create(&host_path(id), host_payload("second")).unwrap();
    assert_eq!(created_name(recv_within(&mut events).await), "second");
    monitor.stop().await;
}

#[tokio::test]
async fn test_late_subscriber_replays_live_entities() {
    let (store, monitor) = host_monitor();
    store.create(&host_path(host_id(1)), host_payload("a")).unwrap();
    store.create(&host_path(host_id(2)), host_payload("b")).unwrap();

    let mut early = subscribe(&monitor);
    monitor.start().unwrap();
    recv_within(&mut early).await;
    recv_within(&mut early).await;

    let mut late = subscribe(&monitor);
    let replayed: Vec<String> = vec![
        created_name(recv_within(&mut late).await),
        created_name(recv_within(&mut late).await),
    ];
    assert_eq!(replayed, vec!["a".to_string(), "b".to_string()]);

    store.set_data(&host_path(host_id(1)), host_payload("a2")).unwrap();
    assert!(matches!(recv_within(&mut late).await, DeviceEvent::Update { .. }));
    assert!(matches!(recv_within(&mut early).await, DeviceEvent::Update { .. }));
    monitor.stop().await;
}

#[tokio::test]
async fn test_replay_can_be_disabled() {
    let (store, client, mut config, _) = host_fixture();
    config.watch.replay_on_subscribe = false;
    let monitor = HostMonitor::for_hosts(client, config);
    store.create(&host_path(host_id(1)), host_payload("a")).unwrap();

    let mut early = subscribe(&monitor);
    monitor.start().unwrap();
    recv_within(&mut early).await;

    let mut late = subscribe(&monitor);
    assert_quiet(&mut late).await;
    monitor.stop().await;
}

#[tokio::test]
async fn test_unsubscribed_subscriber_receives_nothing() {
    let (store, monitor) = host_monitor();
    let (subscriber, mut events) = ChannelSubscriber::new();
    let id = monitor.subscribe(subscriber).unwrap();
    monitor.start().unwrap();

    assert!(monitor.unsubscribe(id));
    assert!(!monitor.unsubscribe(id));
    store.create(&host_path(host_id(1)), host_payload("a")).unwrap();
    assert_quiet(&mut events).await;
    monitor.stop().await;
}

#[tokio::test]
async fn test_no_callbacks_after_stop() {
    let (store, monitor) = host_monitor();
    let mut events = subscribe(&monitor);
    monitor.start().unwrap();
    store.create(&host_path(host_id(1)), host_payload("a")).unwrap();
    recv_within(&mut events).await;

    monitor.stop().await;
    store.set_data(&host_path(host_id(1)), host_payload("b")).unwrap();
    store.create(&host_path(host_id(2)), host_payload("c")).unwrap();
    assert_quiet(&mut events).await;
    assert_eq!(store.child_watch_count("/midonet/v1/hosts"), 0);
    assert_eq!(store.data_watch_count(&host_path(host_id(1))), 0);
}

#[tokio::test]
async fn test_disconnect_and_reconnect_are_signalled() {
    let (store, monitor) = host_monitor();
    let mut events = subscribe(&monitor);
    monitor.start().unwrap();
    assert_quiet(&mut events).await;

    store.disconnect();
    assert!(matches!(
        recv_within(&mut events).await,
        DeviceEvent::Connection {
            state: ConnectionState::Disconnected
        }
    ));

    store.reconnect();
    assert!(matches!(
        recv_within(&mut events).await,
        DeviceEvent::Connection {
            state: ConnectionState::Connected
        }
    ));
    monitor.stop().await;
}

#[tokio::test]
async fn test_changes_while_disconnected_are_delivered_after_reconnect() {
    let (store, monitor) = host_monitor();
    let id = host_id(1);
    store.create(&host_path(id), host_payload("alpha")).unwrap();
    let mut events = subscribe(&monitor);
    monitor.start().unwrap();
    recv_within(&mut events).await;

    store.disconnect();
    recv_within(&mut events).await;
    store.set_data(&host_path(id), host_payload("beta")).unwrap();
    store.reconnect();

    let mut saw_update = false;
    for _ in 0..2 {
        if let DeviceEvent::Update { entity, .. } = recv_within(&mut events).await {
            assert_eq!(entity.name, "beta");
            saw_update = true;
        }
    }
    assert!(saw_update);
    monitor.stop().await;
}

#[tokio::test]
async fn test_session_expiry_resyncs_with_minimal_events() {
    enable_logger();
    let (store, monitor) = host_monitor();
    let kept = host_id(1);
    let removed = host_id(2);
    let changed = host_id(3);
    let added = host_id(4);
    for (id, name) in [(kept, "kept"), (removed, "removed"), (changed, "changed")] {
        store.create(&host_path(id), host_payload(name)).unwrap();
    }
    let mut events = subscribe(&monitor);
    monitor.start().unwrap();
    for _ in 0..3 {
        recv_within(&mut events).await;
    }

    let epoch = store.expire_session();
    store.delete(&host_path(removed)).unwrap();
    store.set_data(&host_path(changed), host_payload("changed again")).unwrap();
    store.create(&host_path(added), host_payload("added")).unwrap();
    store.reconnect();

    let mut received = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(QUIET * 4, events.recv()).await {
        received.push(event);
    }

    assert!(matches!(
        received.first(),
        Some(DeviceEvent::Connection {
            state: ConnectionState::Expired
        })
    ));
    assert!(received.iter().any(|e| matches!(
        e,
        DeviceEvent::Resync { epoch: started, phase: ResyncPhase::Started } if *started == epoch
    )));
    assert!(received.iter().any(|e| matches!(
        e,
        DeviceEvent::Resync { phase: ResyncPhase::Completed, .. }
    )));

    let touched: BTreeSet<_> = received.iter().filter_map(|e| e.id().copied()).collect();
    assert!(!touched.contains(&kept), "unchanged entity must not produce events: {received:?}");
    assert!(received.iter().any(|e| matches!(e, DeviceEvent::Delete { id } if *id == removed)));
    assert!(received.iter().any(|e| matches!(e, DeviceEvent::Update { id, .. } if *id == changed)));
    assert!(received.iter().any(|e| matches!(e, DeviceEvent::Create { id, .. } if *id == added)));
    assert_eq!(received.iter().filter(|e| e.id().is_some()).count(), 3);
    monitor.stop().await;
}

#[tokio::test]
async fn test_unreadable_entity_is_signalled_without_create() {
    let (store, monitor) = host_monitor();
    let id = host_id(1);
    store.create(&host_path(id), "garbage").unwrap();
    let mut events = subscribe(&monitor);
    monitor.start().unwrap();

    assert!(matches!(recv_within(&mut events).await, DeviceEvent::Unreadable { id: bad, .. } if bad == id));

    // never live, so no delete either
    store.delete(&host_path(id)).unwrap();
    assert_quiet(&mut events).await;
    monitor.stop().await;
}

#[tokio::test]
async fn test_monitor_for_custom_collection_root() {
    let (store, client, mut config, _) = host_fixture();
    config.store.root_path = "/tenant-a".to_string();
    let kind = HostKind::new(&config.store);
    let monitor = DeviceMonitor::new(kind, client, config);
    store.create(&format!("/tenant-a/hosts/{}", host_id(1)), host_payload("scoped")).unwrap();
    store.create(&host_path(host_id(2)), host_payload("elsewhere")).unwrap();

    let mut events = subscribe(&monitor);
    monitor.start().unwrap();
    assert_eq!(created_name(recv_within(&mut events).await), "scoped");
    assert_quiet(&mut events).await;
    monitor.stop().await;
}

#[tokio::test]
async fn test_id_set_failure_while_connected_recovers() {
    enable_logger();
    let (store, client, mut config, _) = host_fixture();
    config.retry.store.max_retries = 1;
    config.retry.store.base_delay_ms = 10;
    let monitor = HostMonitor::for_hosts(client, config);
    store.inject_transient_failures(3);

    let mut events = subscribe(&monitor);
    monitor.start().unwrap();
    assert!(matches!(
        recv_within(&mut events).await,
        DeviceEvent::Connection {
            state: ConnectionState::Degraded
        }
    ));

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    store.put(&host_path(host_id(1)), host_payload("h1")).unwrap();

    let mut received = Vec::new();
    loop {
        let event = recv_within(&mut events).await;
        let created = matches!(&event, DeviceEvent::Create { id, .. } if *id == host_id(1));
        received.push(event);
        if created {
            break;
        }
    }
    assert!(
        received.iter().any(|e| matches!(
            e,
            DeviceEvent::Connection {
                state: ConnectionState::Connected
            }
        )),
        "{received:?}"
    );
    monitor.stop().await;
}

struct SlowSubscriber {
    entered: std::sync::atomic::AtomicBool,
    finished: std::sync::atomic::AtomicBool,
}

impl Subscriber<uuid::Uuid, crate::Host> for SlowSubscriber {
    fn on_create(
        &self,
        _id: &uuid::Uuid,
        _entity: Arc<crate::Host>,
    ) {
        self.entered.store(true, std::sync::atomic::Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(200));
        self.finished.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn on_update(
        &self,
        _id: &uuid::Uuid,
        _entity: Arc<crate::Host>,
    ) {
    }

    fn on_delete(
        &self,
        _id: &uuid::Uuid,
    ) {
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_waits_for_callback_of_unsubscribed_subscriber() {
    let (store, monitor) = host_monitor();
    store.create(&host_path(host_id(1)), host_payload("a")).unwrap();
    let subscriber = Arc::new(SlowSubscriber {
        entered: std::sync::atomic::AtomicBool::new(false),
        finished: std::sync::atomic::AtomicBool::new(false),
    });
    let id = monitor.subscribe(subscriber.clone()).unwrap();
    monitor.start().unwrap();

    tokio::time::timeout(WAIT, async {
        while !subscriber.entered.load(std::sync::atomic::Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Timeout waiting for callback");
    assert!(monitor.unsubscribe(id));
    monitor.stop().await;
    assert!(subscriber.finished.load(std::sync::atomic::Ordering::SeqCst));
}
