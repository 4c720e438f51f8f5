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

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bridge {
    pub name: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default = "default_admin_state_up")]
    pub admin_state_up: bool,
    /// Ports binding this bridge to VTEPs
    #[serde(default)]
    pub vxlan_port_ids: Vec<Uuid>,
}

fn default_admin_state_up() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct BridgeKind {
    collection: String,
}

impl BridgeKind {
    pub fn new(store: &StoreConfig) -> Self {
        Self {
            collection: store.collection("bridges"),
        }
    }
}

impl EntityKind for BridgeKind {
    type Id = Uuid;
    type Entity = Bridge;

    fn name(&self) -> &'static str {
        "bridge"
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
    ) -> Result<Bridge, DecodeError> {
        decode_json(self.node_path(id), payload)
    }
}

pub type BridgeMonitor = DeviceMonitor<BridgeKind>;

impl DeviceMonitor<BridgeKind> {
    /// Monitor over `{root}/bridges`
    pub fn for_bridges(
        client: Arc<dyn CoordinationClient>,
        config: MonitorConfig,
    ) -> Self {
        let kind = BridgeKind::new(&config.store);
        DeviceMonitor::new(kind, client, config)
    }
}
