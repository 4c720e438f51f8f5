#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use topology_monitor::ChannelSubscriber;
use topology_monitor::CoordinationClient;
use topology_monitor::DeviceEvent;
use topology_monitor::Host;
use topology_monitor::HostMonitor;
use topology_monitor::MemoryCoordinationStore;
use topology_monitor::MonitorConfig;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(1);
pub const QUIET: Duration = Duration::from_millis(150);

pub type HostEvent = DeviceEvent<Uuid, Host>;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
}

pub fn host_id(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

pub fn host_payload(name: &str) -> String {
    format!(r#"{{"name":"{name}","ip":"10.0.0.1"}}"#)
}

/// A memory store, a host monitor on it and one channel subscriber
pub struct HostHarness {
    pub store: Arc<MemoryCoordinationStore>,
    pub monitor: HostMonitor,
    pub events: mpsc::UnboundedReceiver<HostEvent>,
    collection: String,
}

impl HostHarness {
    pub fn new() -> Self {
        Self::with_config(MonitorConfig::default())
    }

    pub fn with_config(config: MonitorConfig) -> Self {
        let store = Arc::new(MemoryCoordinationStore::new());
        let client: Arc<dyn CoordinationClient> = store.clone();
        let collection = config.store.collection("hosts");
        let monitor = HostMonitor::for_hosts(client, config);
        let (subscriber, events) = ChannelSubscriber::new();
        monitor.subscribe(subscriber).expect("subscribe before start");
        Self {
            store,
            monitor,
            events,
            collection,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn path(
        &self,
        id: Uuid,
    ) -> String {
        format!("{}/{}", self.collection, id)
    }

    pub fn put_host(
        &self,
        id: Uuid,
        name: &str,
    ) {
        self.store.put(&self.path(id), host_payload(name)).unwrap();
    }

    pub async fn next_event(&mut self) -> HostEvent {
        timeout(WAIT, self.events.recv())
            .await
            .expect("Timeout waiting for event")
            .expect("Channel closed")
    }

    /// Collects events until none arrives for [`QUIET`]
    pub async fn drain(&mut self) -> Vec<HostEvent> {
        let mut received = Vec::new();
        while let Ok(Some(event)) = timeout(QUIET, self.events.recv()).await {
            received.push(event);
        }
        received
    }
}

/// Replays an event stream and fails on any per-id sequence outside
/// `(Create Update* Delete)*`.
#[derive(Debug, Default)]
pub struct LifecycleChecker {
    live: BTreeMap<Uuid, Arc<Host>>,
}

impl LifecycleChecker {
    pub fn apply(
        &mut self,
        event: &HostEvent,
    ) {
        match event {
            DeviceEvent::Create { id, entity } => {
                assert!(!self.live.contains_key(id), "Create for live entity {id}");
                self.live.insert(*id, entity.clone());
            }
            DeviceEvent::Update { id, entity } => {
                assert!(self.live.contains_key(id), "Update before Create for {id}");
                self.live.insert(*id, entity.clone());
            }
            DeviceEvent::Delete { id } => {
                assert!(self.live.remove(id).is_some(), "Delete without live entity {id}");
            }
            DeviceEvent::Unreadable { .. } | DeviceEvent::Resync { .. } | DeviceEvent::Connection { .. } => {}
        }
    }

    pub fn apply_all<'a>(
        &mut self,
        events: impl IntoIterator<Item = &'a HostEvent>,
    ) {
        for event in events {
            self.apply(event);
        }
    }

    pub fn live_names(&self) -> BTreeMap<Uuid, String> {
        self.live.iter().map(|(id, host)| (*id, host.name.clone())).collect()
    }
}

pub fn entity_events<'a>(
    events: &'a [HostEvent],
    id: Uuid,
) -> Vec<&'a HostEvent> {
    events.iter().filter(|e| e.id() == Some(&id)).collect()
}
