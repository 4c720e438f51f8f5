//! Coordination store access for the monitors.
//!
//! The store is a remote hierarchical key space (ZooKeeper semantics) whose
//! only change notification is a one-shot watch:
//!
//! ```text
//!  list_children_and_watch(path) ──► (children, token) ──► fires once on next child change
//!  read_and_watch(path)          ──► (data?,   token)  ──► fires once on next data change,
//!                                                         creation or deletion
//! ```
//!
//! Listing and arming happen in one call so no change can slip between them.
//! Firings are delivered as [`WatchFired`] messages to the [`WatchSink`]
//! supplied when the watch was armed. Session transitions are broadcast to
//! every interested monitor through [`CoordinationClient::session_events`].
//!
//! A session expiry drops every watch registered under it and bumps the
//! [`SessionEpoch`]. The epoch is the one piece of state shared by every
//! watcher on a connection; a watcher whose epoch no longer matches must drop
//! whatever it observed.

pub mod memory;


pub use memory::MemoryCoordinationStore;

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use tokio::sync::broadcast;
use tokio::sync::mpsc;

use crate::StoreError;

/// Counter identifying one continuous store session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionEpoch(pub u64);

impl SessionEpoch {
    pub fn next(self) -> Self {
        SessionEpoch(self.0 + 1)
    }
}

impl fmt::Display for SessionEpoch {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An outstanding single-fire watch registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchToken {
    id: u64,
    epoch: SessionEpoch,
}

impl WatchToken {
    pub fn new(
        id: u64,
        epoch: SessionEpoch,
    ) -> Self {
        Self { id, epoch }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Session the watch was registered under
    pub fn epoch(&self) -> SessionEpoch {
        self.epoch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Children,
    Data,
}

/// Notification that a watch fired. The watch is consumed.
#[derive(Debug, Clone)]
pub struct WatchFired {
    pub token: WatchToken,
    pub path: String,
    pub kind: WatchKind,
}

pub type WatchSink = mpsc::UnboundedSender<WatchFired>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session (re-)established; `epoch` is the live session
    Connected,
    /// Connection lost, session and watches may survive
    Disconnected,
    /// Session gone; `epoch` is the already bumped epoch
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEvent {
    pub epoch: SessionEpoch,
    pub state: SessionState,
}

impl SessionEvent {
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }
}

/// Read side of the coordination store shared by every monitor on one
/// connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    /// Lists the child names of `path` and arms a children watch.
    ///
    /// A missing `path` lists as empty; the watch fires once children appear.
    async fn list_children_and_watch(
        &self,
        path: &str,
        sink: WatchSink,
    ) -> Result<(BTreeSet<String>, WatchToken), StoreError>;

    /// Reads the data of `path` and arms a data watch.
    ///
    /// Returns `None` when the node does not exist; the watch then fires on
    /// creation.
    async fn read_and_watch(
        &self,
        path: &str,
        sink: WatchSink,
    ) -> Result<(Option<Bytes>, WatchToken), StoreError>;

    /// Removes an armed watch. Once this returns the token never fires.
    fn cancel_watch(
        &self,
        token: WatchToken,
    );

    fn current_epoch(&self) -> SessionEpoch;

    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}
