use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::coordination::CoordinationClient;
use crate::DeviceEvent;
use crate::Host;
use crate::HostKind;
use crate::MemoryCoordinationStore;
use crate::MonitorConfig;

pub(crate) const WAIT: Duration = Duration::from_millis(500);
pub(crate) const QUIET: Duration = Duration::from_millis(50);

pub(crate) type HostEvent = DeviceEvent<Uuid, Host>;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
}

pub(crate) fn host_id(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

pub(crate) fn host_payload(name: &str) -> String {
    format!(r#"{{"name":"{name}","ip":"10.0.0.1"}}"#)
}

/// Store plus a host kind rooted at the default collection
pub(crate) fn host_fixture() -> (Arc<MemoryCoordinationStore>, Arc<dyn CoordinationClient>, MonitorConfig, HostKind) {
    let store = Arc::new(MemoryCoordinationStore::new());
    let client: Arc<dyn CoordinationClient> = store.clone();
    let config = MonitorConfig::default();
    let kind = HostKind::new(&config.store);
    (store, client, config, kind)
}

pub(crate) fn host_path(id: Uuid) -> String {
    format!("/midonet/v1/hosts/{id}")
}

pub(crate) async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("Timeout waiting for event")
        .expect("Channel closed")
}

pub(crate) async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(Some(unexpected)) = timeout(QUIET, rx.recv()).await {
        panic!("unexpected event: {unexpected:?}");
    }
}
