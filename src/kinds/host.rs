use std::net::IpAddr;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use super::decode_json;
use super::parse_child;
use super::EntityKind;
use crate::CoordinationClient;
use crate::DecodeError;
use crate::DeviceMonitor;
use crate::MonitorConfig;
use crate::StoreConfig;

/// Host metadata as written under `{root}/hosts/{uuid}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub ip: IpAddr,
    /// Preference for carrying flooded traffic on behalf of VTEPs
    #[serde(default = "default_flooding_proxy_weight")]
    pub flooding_proxy_weight: u32,
}

fn default_flooding_proxy_weight() -> u32 {
    1
}

#[derive(Debug, Clone)]
pub struct HostKind {
    collection: String,
}

impl HostKind {
    pub fn new(store: &StoreConfig) -> Self {
        Self {
            collection: store.collection("hosts"),
        }
    }
}

impl EntityKind for HostKind {
    type Id = Uuid;
    type Entity = Host;

    fn name(&self) -> &'static str {
        "host"
    }

    fn collection_path(&self) -> &str {
        &self.collection
    }

    fn parse_id(
        &self,
        child: &str,
    ) -> Result<Uuid, DecodeError> {
        parse_child(child)
    }

    fn decode(
        &self,
        id: &Uuid,
        payload: &[u8],
    ) -> Result<Host, DecodeError> {
        decode_json(self.node_path(id), payload)
    }
}

pub type HostMonitor = DeviceMonitor<HostKind>;

impl DeviceMonitor<HostKind> {
    /// Monitor over `{root}/hosts`
    pub fn for_hosts(
        client: Arc<dyn CoordinationClient>,
        config: MonitorConfig,
    ) -> Self {
        let kind = HostKind::new(&config.store);
        DeviceMonitor::new(kind, client, config)
    }
}
