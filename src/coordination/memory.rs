//! In-process coordination store with ZooKeeper watch semantics.
//!
//! Used as the write-path stand-in by tests and embedders. Writes never fail
//! because of the monitored session: they model another client writing to
//! the remote store. Only the read side (the [`CoordinationClient`] calls) is
//! bound to the simulated session:
//!
//! - while disconnected, calls fail with [`StoreError::ConnectionLoss`] and
//!   firings are held back until [`MemoryCoordinationStore::reconnect`]
//! - [`MemoryCoordinationStore::expire_session`] bumps the epoch and drops
//!   every armed watch, as a real session expiry does

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::trace;

use super::CoordinationClient;
use super::SessionEpoch;
use super::SessionEvent;
use super::SessionState;
use super::WatchFired;
use super::WatchKind;
use super::WatchSink;
use super::WatchToken;
use crate::StoreError;

const SESSION_EVENT_CAPACITY: usize = 64;

struct ArmedWatch {
    token: WatchToken,
    sink: WatchSink,
}

struct StoreState {
    nodes: BTreeMap<String, Bytes>,
    child_watches: HashMap<String, Vec<ArmedWatch>>,
    data_watches: HashMap<String, Vec<ArmedWatch>>,
    connected: bool,
    /// Firings that happened while disconnected
    deferred: Vec<(WatchSink, WatchFired)>,
    /// Number of upcoming client calls to fail with `ConnectionLoss`
    injected_failures: usize,
}

pub struct MemoryCoordinationStore {
    state: Mutex<StoreState>,
    epoch: AtomicU64,
    next_token: AtomicU64,
    session_tx: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for MemoryCoordinationStore {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryCoordinationStore")
            .field("nodes", &state.nodes.len())
            .field("connected", &state.connected)
            .field("epoch", &self.epoch.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Default for MemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        let (session_tx, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            state: Mutex::new(StoreState {
                nodes: BTreeMap::new(),
                child_watches: HashMap::new(),
                data_watches: HashMap::new(),
                connected: true,
                deferred: Vec::new(),
                injected_failures: 0,
            }),
            epoch: AtomicU64::new(1),
            next_token: AtomicU64::new(1),
            session_tx,
        }
    }

    //-----------------------------------------------------------
    // Write side

    /// Creates `path`, creating missing ancestors with empty data.
    pub fn create(
        &self,
        path: &str,
        data: impl Into<Bytes>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.nodes.contains_key(path) {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        self.ensure_ancestors(&mut state, path);
        state.nodes.insert(path.to_string(), data.into());
        self.fire(&mut state, path, WatchKind::Data);
        self.fire(&mut state, parent_of(path), WatchKind::Children);
        Ok(())
    }

    /// Replaces the data of an existing node. Fires data watches even when
    /// the bytes are unchanged, like a version-only write.
    pub fn set_data(
        &self,
        path: &str,
        data: impl Into<Bytes>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        match state.nodes.get_mut(path) {
            Some(slot) => *slot = data.into(),
            None => return Err(StoreError::NoNode(path.to_string())),
        }
        self.fire(&mut state, path, WatchKind::Data);
        Ok(())
    }

    /// Creates or overwrites `path`
    pub fn put(
        &self,
        path: &str,
        data: impl Into<Bytes>,
    ) -> Result<(), StoreError> {
        let data = data.into();
        loop {
            match self.set_data(path, data.clone()) {
                Err(StoreError::NoNode(_)) => {}
                other => return other,
            }
            match self.create(path, data.clone()) {
                // a concurrent create won; overwrite its data instead
                Err(StoreError::NodeExists(_)) => {
                    trace!(path, "node appeared during put");
                }
                other => return other,
            }
        }
    }

    /// Rewrites a node with its current data
    pub fn touch(
        &self,
        path: &str,
    ) -> Result<(), StoreError> {
        let current = self
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        self.set_data(path, current)
    }

    pub fn delete(
        &self,
        path: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        if !children_of(&state.nodes, path).is_empty() {
            return Err(StoreError::NotEmpty(path.to_string()));
        }
        state.nodes.remove(path);
        self.fire(&mut state, path, WatchKind::Data);
        self.fire(&mut state, parent_of(path), WatchKind::Children);
        Ok(())
    }

    pub fn get(
        &self,
        path: &str,
    ) -> Option<Bytes> {
        self.state.lock().nodes.get(path).cloned()
    }

    pub fn children(
        &self,
        path: &str,
    ) -> BTreeSet<String> {
        children_of(&self.state.lock().nodes, path)
    }

    //-----------------------------------------------------------
    // Session simulation

    /// Drops the connection. The session and its watches survive.
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        if !state.connected {
            return;
        }
        state.connected = false;
        let epoch = self.current_epoch();
        debug!(%epoch, "memory store disconnected");
        let _ = self.session_tx.send(SessionEvent {
            epoch,
            state: SessionState::Disconnected,
        });
    }

    /// Re-establishes the connection and delivers firings held back while
    /// disconnected. After an expiry this opens the new session.
    pub fn reconnect(&self) {
        let mut state = self.state.lock();
        if state.connected {
            return;
        }
        state.connected = true;
        for (sink, fired) in state.deferred.drain(..) {
            let _ = sink.send(fired);
        }
        let epoch = self.current_epoch();
        debug!(%epoch, "memory store reconnected");
        let _ = self.session_tx.send(SessionEvent {
            epoch,
            state: SessionState::Connected,
        });
    }

    /// Expires the session: every watch is dropped, the epoch is bumped and
    /// the store stays disconnected until [`Self::reconnect`].
    pub fn expire_session(&self) -> SessionEpoch {
        let mut state = self.state.lock();
        state.connected = false;
        state.child_watches.clear();
        state.data_watches.clear();
        state.deferred.clear();
        let epoch = SessionEpoch(self.epoch.fetch_add(1, Ordering::AcqRel) + 1);
        debug!(%epoch, "memory store session expired");
        let _ = self.session_tx.send(SessionEvent {
            epoch,
            state: SessionState::Expired,
        });
        epoch
    }

    /// Makes the next `count` client calls fail with `ConnectionLoss`
    pub fn inject_transient_failures(
        &self,
        count: usize,
    ) {
        self.state.lock().injected_failures = count;
    }

    pub fn child_watch_count(
        &self,
        path: &str,
    ) -> usize {
        self.state.lock().child_watches.get(path).map(|w| w.len()).unwrap_or(0)
    }

    pub fn data_watch_count(
        &self,
        path: &str,
    ) -> usize {
        self.state.lock().data_watches.get(path).map(|w| w.len()).unwrap_or(0)
    }

    //-----------------------------------------------------------
    // Internals

    fn ensure_ancestors(
        &self,
        state: &mut StoreState,
        path: &str,
    ) {
        let mut missing = Vec::new();
        let mut current = parent_of(path);
        while current != "/" && !state.nodes.contains_key(current) {
            missing.push(current.to_string());
            current = parent_of(current);
        }
        for ancestor in missing.into_iter().rev() {
            state.nodes.insert(ancestor.clone(), Bytes::new());
            self.fire(state, &ancestor, WatchKind::Data);
            self.fire(state, parent_of(&ancestor), WatchKind::Children);
        }
    }

    fn fire(
        &self,
        state: &mut StoreState,
        path: &str,
        kind: WatchKind,
    ) {
        let watches = match kind {
            WatchKind::Children => state.child_watches.remove(path),
            WatchKind::Data => state.data_watches.remove(path),
        };
        let Some(watches) = watches else {
            return;
        };

        for watch in watches {
            let fired = WatchFired {
                token: watch.token,
                path: path.to_string(),
                kind,
            };
            trace!(path, ?kind, token = watch.token.id(), "watch fired");
            if state.connected {
                let _ = watch.sink.send(fired);
            } else {
                state.deferred.push((watch.sink, fired));
            }
        }
    }

    fn check_session(
        &self,
        state: &mut StoreState,
    ) -> Result<(), StoreError> {
        if !state.connected {
            return Err(StoreError::ConnectionLoss);
        }
        if state.injected_failures > 0 {
            state.injected_failures -= 1;
            return Err(StoreError::ConnectionLoss);
        }
        Ok(())
    }

    fn arm(
        &self,
        sink: WatchSink,
    ) -> ArmedWatch {
        let token = WatchToken::new(
            self.next_token.fetch_add(1, Ordering::Relaxed),
            self.current_epoch(),
        );
        ArmedWatch { token, sink }
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordinationStore {
    async fn list_children_and_watch(
        &self,
        path: &str,
        sink: WatchSink,
    ) -> Result<(BTreeSet<String>, WatchToken), StoreError> {
        let mut state = self.state.lock();
        self.check_session(&mut state)?;

        let children = children_of(&state.nodes, path);
        let watch = self.arm(sink);
        let token = watch.token;
        state.child_watches.entry(path.to_string()).or_default().push(watch);
        Ok((children, token))
    }

    async fn read_and_watch(
        &self,
        path: &str,
        sink: WatchSink,
    ) -> Result<(Option<Bytes>, WatchToken), StoreError> {
        let mut state = self.state.lock();
        self.check_session(&mut state)?;

        let data = state.nodes.get(path).cloned();
        let watch = self.arm(sink);
        let token = watch.token;
        state.data_watches.entry(path.to_string()).or_default().push(watch);
        Ok((data, token))
    }

    fn cancel_watch(
        &self,
        token: WatchToken,
    ) {
        let mut state = self.state.lock();
        let state = &mut *state;
        for watches in [&mut state.child_watches, &mut state.data_watches] {
            watches.retain(|_, armed| {
                armed.retain(|w| w.token != token);
                !armed.is_empty()
            });
        }
        state.deferred.retain(|(_, fired)| fired.token != token);
    }

    fn current_epoch(&self) -> SessionEpoch {
        SessionEpoch(self.epoch.load(Ordering::Acquire))
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

fn children_of(
    nodes: &BTreeMap<String, Bytes>,
    path: &str,
) -> BTreeSet<String> {
    let prefix = if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    };
    nodes
        .range(prefix.clone()..)
        .take_while(|(key, _)| key.starts_with(&prefix))
        .filter_map(|(key, _)| {
            let rest = &key[prefix.len()..];
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        })
        .collect()
}
