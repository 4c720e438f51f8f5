use std::fmt;
use std::sync::Arc;

use crate::coordination::SessionEpoch;
use crate::DecodeError;

/// Handle returned by [`crate::DeviceMonitor::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncPhase {
    /// The session expired; the view is being rebuilt
    Started,
    /// Every surviving entity is watched again under the new session
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Connection lost; the session and its watches may still come back
    Disconnected,
    /// Connected, but the id listing keeps failing
    Degraded,
    /// Session expired, resync pending
    Expired,
}

/// One entry of a subscriber's event stream.
///
/// Per id the entity events follow the grammar
/// `(Create Update* Delete)*` with optional `Unreadable` markers in between.
#[derive(Debug)]
pub enum DeviceEvent<Id, T> {
    Create { id: Id, entity: Arc<T> },
    Update { id: Id, entity: Arc<T> },
    Delete { id: Id },
    /// The payload of `id` could not be decoded. Nothing is implied about
    /// whether the entity is live.
    Unreadable { id: Id, error: Arc<DecodeError> },
    Resync { epoch: SessionEpoch, phase: ResyncPhase },
    Connection { state: ConnectionState },
}

impl<Id: Clone, T> Clone for DeviceEvent<Id, T> {
    fn clone(&self) -> Self {
        match self {
            DeviceEvent::Create { id, entity } => DeviceEvent::Create {
                id: id.clone(),
                entity: entity.clone(),
            },
            DeviceEvent::Update { id, entity } => DeviceEvent::Update {
                id: id.clone(),
                entity: entity.clone(),
            },
            DeviceEvent::Delete { id } => DeviceEvent::Delete { id: id.clone() },
            DeviceEvent::Unreadable { id, error } => DeviceEvent::Unreadable {
                id: id.clone(),
                error: error.clone(),
            },
            DeviceEvent::Resync { epoch, phase } => DeviceEvent::Resync {
                epoch: *epoch,
                phase: *phase,
            },
            DeviceEvent::Connection { state } => DeviceEvent::Connection { state: *state },
        }
    }
}

impl<Id, T> DeviceEvent<Id, T> {
    /// Entity the event is about, `None` for monitor-wide signals
    pub fn id(&self) -> Option<&Id> {
        match self {
            DeviceEvent::Create { id, .. }
            | DeviceEvent::Update { id, .. }
            | DeviceEvent::Delete { id }
            | DeviceEvent::Unreadable { id, .. } => Some(id),
            DeviceEvent::Resync { .. } | DeviceEvent::Connection { .. } => None,
        }
    }

    pub fn entity(&self) -> Option<&Arc<T>> {
        match self {
            DeviceEvent::Create { entity, .. } | DeviceEvent::Update { entity, .. } => Some(entity),
            _ => None,
        }
    }

    /// Metric and log label
    pub fn label(&self) -> &'static str {
        match self {
            DeviceEvent::Create { .. } => "create",
            DeviceEvent::Update { .. } => "update",
            DeviceEvent::Delete { .. } => "delete",
            DeviceEvent::Unreadable { .. } => "unreadable",
            DeviceEvent::Resync { .. } => "resync",
            DeviceEvent::Connection { .. } => "connection",
        }
    }
}
