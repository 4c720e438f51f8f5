//! Single-entity data watch.
//!
//! Keeps one entity's payload under observation by re-arming a one-shot data
//! watch after every firing. Every observation is decoded on the watcher
//! task and reported to the owning [`super::EntityMonitor`] tagged with the
//! session epoch and the watcher generation, so the owner can drop reports
//! from watchers it has already replaced.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::trace;

use super::WatchGuard;
use crate::coordination::CoordinationClient;
use crate::coordination::SessionEpoch;
use crate::coordination::WatchToken;
use crate::metrics::WATCH_FIRINGS;
use crate::utils::retry_with_backoff;
use crate::BackoffPolicy;
use crate::DecodeError;
use crate::EntityKind;
use crate::StoreError;

#[derive(Debug)]
pub(crate) enum DataEvent<T> {
    /// Node holds a decodable payload
    Snapshot { raw: Bytes, entity: Arc<T> },
    /// Node missing or empty.
    ///
    /// `terminal` is set once a node that had data disappears; the watcher
    /// has stopped. A missing node before any data was seen is not terminal:
    /// the watch stays armed and reports the creation.
    Absent { terminal: bool },
    /// Payload present but undecodable; the watcher has stopped
    Unreadable { raw: Bytes, error: Arc<DecodeError> },
    /// Read-and-watch failed beyond retry; the watcher has stopped
    Failed(StoreError),
}

#[derive(Debug)]
pub(crate) struct WatcherOutput<Id, T> {
    pub(crate) id: Id,
    pub(crate) epoch: SessionEpoch,
    pub(crate) generation: u64,
    pub(crate) event: DataEvent<T>,
}

pub(crate) type OutputSender<Id, T> = mpsc::UnboundedSender<WatcherOutput<Id, T>>;

/// Handle to a running data watch; stops the watch when dropped
pub(crate) struct EntityDataWatcher {
    guard: WatchGuard,
    client: Arc<dyn CoordinationClient>,
}

impl EntityDataWatcher {
    pub(crate) fn start<K: EntityKind>(
        kind: Arc<K>,
        client: Arc<dyn CoordinationClient>,
        id: K::Id,
        epoch: SessionEpoch,
        generation: u64,
        retry: BackoffPolicy,
        output: OutputSender<K::Id, K::Entity>,
    ) -> Self {
        let guard = WatchGuard::new();
        let task = DataWatchTask {
            path: kind.node_path(&id),
            kind,
            client: client.clone(),
            id,
            epoch,
            generation,
            retry,
            guard: guard.clone(),
            output,
        };
        tokio::spawn(task.run());
        Self { guard, client }
    }

    /// Stops the watch. Once this returns the watcher reports nothing more
    /// and holds no armed token.
    pub(crate) fn stop(&self) {
        self.guard.stop(self.client.as_ref());
    }

    pub(crate) fn is_live(&self) -> bool {
        self.guard.is_live()
    }
}

impl Drop for EntityDataWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct DataWatchTask<K: EntityKind> {
    kind: Arc<K>,
    client: Arc<dyn CoordinationClient>,
    id: K::Id,
    path: String,
    epoch: SessionEpoch,
    generation: u64,
    retry: BackoffPolicy,
    guard: WatchGuard,
    output: OutputSender<K::Id, K::Entity>,
}

impl<K: EntityKind> DataWatchTask<K> {
    async fn run(self) {
        let (sink, mut fired_rx) = mpsc::unbounded_channel();
        let mut seen_data = false;

        loop {
            let result = {
                let client = self.client.as_ref();
                let path = self.path.as_str();
                let sink = &sink;
                tokio::select! {
                    biased;
                    _ = self.guard.cancelled() => return,
                    result = retry_with_backoff(&self.retry, path, move || {
                        client.read_and_watch(path, sink.clone())
                    }) => result,
                }
            };

            let (data, token) = match result {
                Ok(read) => read,
                Err(error) => {
                    debug!(path = %self.path, ?error, "data watch failed");
                    self.emit(DataEvent::Failed(error));
                    return;
                }
            };
            if !self.guard.arm(self.client.as_ref(), token) {
                return;
            }
            if token.epoch() != self.epoch {
                trace!(path = %self.path, "data watch armed under a newer session");
                self.guard.stop(self.client.as_ref());
                return;
            }

            match data {
                None if seen_data => {
                    self.finish(token, DataEvent::Absent { terminal: true });
                    return;
                }
                None => self.emit(DataEvent::Absent { terminal: false }),
                Some(raw) if raw.is_empty() => self.emit(DataEvent::Absent { terminal: false }),
                Some(raw) => match self.kind.decode(&self.id, &raw) {
                    Ok(entity) => {
                        seen_data = true;
                        self.emit(DataEvent::Snapshot {
                            raw,
                            entity: Arc::new(entity),
                        });
                    }
                    Err(error) => {
                        debug!(path = %self.path, %error, "undecodable payload");
                        self.finish(
                            token,
                            DataEvent::Unreadable {
                                raw,
                                error: Arc::new(error),
                            },
                        );
                        return;
                    }
                },
            }

            if !self.guard.wait_for_fire(&mut fired_rx, token).await {
                return;
            }
            WATCH_FIRINGS.with_label_values(&[self.kind.name(), "data"]).inc();
        }
    }

    fn emit(
        &self,
        event: DataEvent<K::Entity>,
    ) {
        if !self.guard.is_live() {
            return;
        }
        let _ = self.output.send(WatcherOutput {
            id: self.id.clone(),
            epoch: self.epoch,
            generation: self.generation,
            event,
        });
    }

    /// Reports a terminal event and drops the armed watch
    fn finish(
        &self,
        token: WatchToken,
        event: DataEvent<K::Entity>,
    ) {
        self.guard.release(self.client.as_ref(), token);
        self.emit(event);
    }
}
