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

/// Hardware VTEP, keyed by its management address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vtep {
    pub management_port: u16,
    pub tunnel_zone_id: Uuid,
    #[serde(default)]
    pub tunnel_ips: Vec<IpAddr>,
}

#[derive(Debug, Clone)]
pub struct VtepKind {
    collection: String,
}

impl VtepKind {
    pub fn new(store: &StoreConfig) -> Self {
        Self {
            collection: store.collection("vteps"),
        }
    }
}

impl EntityKind for VtepKind {
    type Id = IpAddr;
    type Entity = Vtep;

    fn name(&self) -> &'static str {
        "vtep"
    }

    fn collection_path(&self) -> &str {
        &self.collection
    }

    fn parse_id(
        &self,
        child: &str,
    ) -> Result<IpAddr, DecodeError> {
        parse_child(child)
    }

    fn decode(
        &self,
        id: &IpAddr,
        payload: &[u8],
    ) -> Result<Vtep, DecodeError> {
        decode_json(self.node_path(id), payload)
    }
}

pub type VtepMonitor = DeviceMonitor<VtepKind>;

impl DeviceMonitor<VtepKind> {
    /// Monitor over `{root}/vteps`
    pub fn for_vteps(
        client: Arc<dyn CoordinationClient>,
        config: MonitorConfig,
    ) -> Self {
        let kind = VtepKind::new(&config.store);
        DeviceMonitor::new(kind, client, config)
    }
}
