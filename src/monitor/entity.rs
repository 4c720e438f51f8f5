//! Per-entity watch bookkeeping and deduplication.
//!
//! [`EntityMonitor`] owns one [`EntityDataWatcher`] per tracked id and
//! folds their reports into entity-level updates:
//!
//! - the first decodable payload of an id becomes a creation, later ones
//!   updates; a payload equal to the last delivered one is suppressed
//! - a node disappearing after it was live becomes a deletion
//! - an undecodable payload is reported once per distinct payload and
//!   re-read with backoff; the last good value stays delivered
//!
//! Reports from a watcher that was replaced (older generation) or that ran
//! under an older session epoch are dropped.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::DataEvent;
use super::EntityDataWatcher;
use super::WatcherOutput;
use crate::coordination::CoordinationClient;
use crate::coordination::SessionEpoch;
use crate::metrics::DEDUP_SUPPRESSED;
use crate::metrics::TRACKED_ENTITIES;
use crate::BackoffPolicy;
use crate::DecodeError;
use crate::DedupPolicy;
use crate::EntityKind;
use crate::MonitorConfig;
use crate::StoreError;

#[derive(Debug)]
pub enum EntityUpdate<Id, T> {
    Snapshot {
        id: Id,
        entity: Arc<T>,
        /// First delivered value of this entity
        created: bool,
    },
    Deleted {
        id: Id,
    },
    Unreadable {
        id: Id,
        error: Arc<DecodeError>,
    },
}

struct Delivered<T> {
    raw: Bytes,
    entity: Arc<T>,
}

struct EntityState<T> {
    generation: u64,
    watcher: Option<EntityDataWatcher>,
    last: Option<Delivered<T>>,
    /// Last payload reported as unreadable
    unreadable: Option<Bytes>,
    retry_attempt: u32,
}

impl<T> EntityState<T> {
    fn new() -> Self {
        Self {
            generation: 0,
            watcher: None,
            last: None,
            unreadable: None,
            retry_attempt: 0,
        }
    }

    fn is_watching(&self) -> bool {
        self.watcher.as_ref().is_some_and(EntityDataWatcher::is_live)
    }
}

struct RetryDue<Id> {
    id: Id,
    generation: u64,
}

enum Outcome<Id, T> {
    Deliver(EntityUpdate<Id, T>),
    Remove { deliver: Option<EntityUpdate<Id, T>> },
    Nothing,
}

/// Watches the payloads of a dynamic set of entities of one kind.
///
/// Owned and driven by a single task, like [`super::EntityIdSetMonitor`].
pub struct EntityMonitor<K: EntityKind> {
    kind: Arc<K>,
    client: Arc<dyn CoordinationClient>,
    dedup: DedupPolicy,
    store_retry: BackoffPolicy,
    unreadable_retry: BackoffPolicy,
    entities: HashMap<K::Id, EntityState<K::Entity>>,
    epoch: SessionEpoch,
    next_generation: u64,
    output_tx: mpsc::UnboundedSender<WatcherOutput<K::Id, K::Entity>>,
    output_rx: mpsc::UnboundedReceiver<WatcherOutput<K::Id, K::Entity>>,
    retry_tx: mpsc::UnboundedSender<RetryDue<K::Id>>,
    retry_rx: mpsc::UnboundedReceiver<RetryDue<K::Id>>,
    /// Cancels pending retry timers
    shutdown: CancellationToken,
}

impl<K: EntityKind> EntityMonitor<K> {
    pub fn new(
        kind: Arc<K>,
        client: Arc<dyn CoordinationClient>,
        config: &MonitorConfig,
        epoch: SessionEpoch,
    ) -> Self {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        Self {
            kind,
            client,
            dedup: config.watch.dedup,
            store_retry: config.retry.store,
            unreadable_retry: config.retry.unreadable,
            entities: HashMap::new(),
            epoch,
            next_generation: 0,
            output_tx,
            output_rx,
            retry_tx,
            retry_rx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Starts watching `id` unless it is already watched
    pub fn notify_on(
        &mut self,
        id: K::Id,
    ) {
        match self.entities.get(&id) {
            Some(state) if state.is_watching() => return,
            Some(_) => {}
            None => {
                self.entities.insert(id.clone(), EntityState::new());
                TRACKED_ENTITIES.with_label_values(&[self.kind.name()]).inc();
            }
        }
        self.start_watcher(&id);
    }

    /// Stops watching `id` and forgets it.
    ///
    /// Returns `None` if the id was not tracked, otherwise whether the
    /// entity was live (a value had been delivered).
    pub fn stop_watching(
        &mut self,
        id: &K::Id,
    ) -> Option<bool> {
        let state = self.entities.remove(id)?;
        TRACKED_ENTITIES.with_label_values(&[self.kind.name()]).dec();
        if let Some(watcher) = &state.watcher {
            watcher.stop();
        }
        Some(state.last.is_some())
    }

    /// Stops every watcher but keeps what was delivered, moving to `epoch`.
    /// Used when the session expires; [`Self::rewatch_all`] re-arms.
    pub fn suspend_all(
        &mut self,
        epoch: SessionEpoch,
    ) {
        self.epoch = epoch;
        for state in self.entities.values_mut() {
            if let Some(watcher) = state.watcher.take() {
                watcher.stop();
            }
        }
    }

    /// Restarts every tracked entity that has no running watcher
    pub fn rewatch_all(&mut self) {
        let idle: Vec<K::Id> = self
            .entities
            .iter()
            .filter(|(_, state)| !state.is_watching())
            .map(|(id, _)| id.clone())
            .collect();
        for id in idle {
            self.start_watcher(&id);
        }
    }

    /// Restarts watchers that stopped on a store failure. Unreadable
    /// entities wait for their own retry.
    pub fn retry_failed(&mut self) {
        let failed: Vec<K::Id> = self
            .entities
            .iter()
            .filter(|(_, state)| !state.is_watching() && state.unreadable.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        for id in failed {
            self.start_watcher(&id);
        }
    }

    pub fn stop_all(&mut self) {
        self.shutdown.cancel();
        let tracked = self.entities.len() as i64;
        for (_, state) in self.entities.drain() {
            if let Some(watcher) = &state.watcher {
                watcher.stop();
            }
        }
        TRACKED_ENTITIES.with_label_values(&[self.kind.name()]).sub(tracked);
    }

    pub fn epoch(&self) -> SessionEpoch {
        self.epoch
    }

    pub fn is_tracking(
        &self,
        id: &K::Id,
    ) -> bool {
        self.entities.contains_key(id)
    }

    pub fn tracked_count(&self) -> usize {
        self.entities.len()
    }

    /// Last value delivered for `id`
    pub fn last_snapshot(
        &self,
        id: &K::Id,
    ) -> Option<Arc<K::Entity>> {
        self.entities
            .get(id)
            .and_then(|state| state.last.as_ref())
            .map(|last| last.entity.clone())
    }

    /// Every live entity in id order
    pub fn live_entities(&self) -> Vec<(K::Id, Arc<K::Entity>)> {
        let mut live: Vec<_> = self
            .entities
            .iter()
            .filter_map(|(id, state)| state.last.as_ref().map(|last| (id.clone(), last.entity.clone())))
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0));
        live
    }

    /// Waits for the next entity-level update. Cancel safe.
    pub async fn next(&mut self) -> Option<EntityUpdate<K::Id, K::Entity>> {
        loop {
            tokio::select! {
                Some(output) = self.output_rx.recv() => {
                    if let Some(update) = self.on_output(output) {
                        return Some(update);
                    }
                }
                Some(due) = self.retry_rx.recv() => self.on_retry_due(due),
                else => return None,
            }
        }
    }

    fn start_watcher(
        &mut self,
        id: &K::Id,
    ) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let Some(state) = self.entities.get_mut(id) else {
            return;
        };
        if let Some(previous) = state.watcher.take() {
            previous.stop();
        }
        state.generation = generation;
        state.watcher = Some(EntityDataWatcher::start(
            self.kind.clone(),
            self.client.clone(),
            id.clone(),
            self.epoch,
            generation,
            self.store_retry,
            self.output_tx.clone(),
        ));
        trace!(entity_kind = self.kind.name(), %id, generation, "data watch started");
    }

    fn on_output(
        &mut self,
        output: WatcherOutput<K::Id, K::Entity>,
    ) -> Option<EntityUpdate<K::Id, K::Entity>> {
        let WatcherOutput {
            id,
            epoch,
            generation,
            event,
        } = output;
        if epoch != self.epoch {
            trace!(entity_kind = self.kind.name(), %id, %epoch, "dropping report of an older session");
            return None;
        }
        let kind_name = self.kind.name();
        let dedup = self.dedup;
        let state = match self.entities.get_mut(&id) {
            Some(state) if state.generation == generation => state,
            _ => {
                trace!(entity_kind = kind_name, %id, generation, "dropping report of a replaced watcher");
                return None;
            }
        };

        let outcome = match event {
            DataEvent::Snapshot { raw, entity } => {
                state.unreadable = None;
                state.retry_attempt = 0;
                let duplicate = match (&state.last, dedup) {
                    (Some(last), DedupPolicy::Decoded) => *last.entity == *entity,
                    (Some(last), DedupPolicy::RawPayload) => last.raw == raw,
                    (None, _) => false,
                };
                if duplicate {
                    DEDUP_SUPPRESSED.with_label_values(&[kind_name]).inc();
                    trace!(entity_kind = kind_name, %id, "suppressing unchanged snapshot");
                    Outcome::Nothing
                } else {
                    let created = state.last.is_none();
                    state.last = Some(Delivered {
                        raw,
                        entity: entity.clone(),
                    });
                    Outcome::Deliver(EntityUpdate::Snapshot {
                        id: id.clone(),
                        entity,
                        created,
                    })
                }
            }
            DataEvent::Absent { terminal: false } => {
                trace!(entity_kind = kind_name, %id, "no data yet");
                Outcome::Nothing
            }
            DataEvent::Absent { terminal: true } => Outcome::Remove {
                deliver: state.last.is_some().then(|| EntityUpdate::Deleted { id: id.clone() }),
            },
            DataEvent::Unreadable { raw, error } => {
                state.watcher = None;
                let repeated = state.unreadable.as_ref() == Some(&raw);
                state.unreadable = Some(raw);
                if repeated {
                    debug!(entity_kind = kind_name, %id, "payload still unreadable");
                } else {
                    warn!(entity_kind = kind_name, %id, %error, "unreadable payload");
                }
                let retry = self.unreadable_retry;
                self.schedule_retry(&id, retry);
                if repeated {
                    Outcome::Nothing
                } else {
                    Outcome::Deliver(EntityUpdate::Unreadable { id: id.clone(), error })
                }
            }
            DataEvent::Failed(error) => {
                state.watcher = None;
                if error == StoreError::SessionExpired {
                    debug!(entity_kind = kind_name, %id, "data watch lost with the session");
                } else {
                    warn!(entity_kind = kind_name, %id, ?error, "data watch failed");
                    let retry = self.store_retry;
                    self.schedule_retry(&id, retry);
                }
                Outcome::Nothing
            }
        };

        match outcome {
            Outcome::Deliver(update) => Some(update),
            Outcome::Remove { deliver } => {
                self.entities.remove(&id);
                TRACKED_ENTITIES.with_label_values(&[kind_name]).dec();
                deliver
            }
            Outcome::Nothing => None,
        }
    }

    fn schedule_retry(
        &mut self,
        id: &K::Id,
        policy: BackoffPolicy,
    ) {
        let Some(state) = self.entities.get_mut(id) else {
            return;
        };
        if policy.max_retries != 0 && state.retry_attempt as usize == policy.max_retries {
            warn!(
                entity_kind = self.kind.name(),
                %id,
                attempts = state.retry_attempt,
                "entity still failing, retrying at the backoff cap"
            );
        }
        // past max_retries the delay stays at max_delay_ms
        let delay = policy.delay_for(state.retry_attempt);
        state.retry_attempt = state.retry_attempt.saturating_add(1);

        let due = RetryDue {
            id: id.clone(),
            generation: state.generation,
        };
        let retry_tx = self.retry_tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = retry_tx.send(due);
                }
            }
        });
    }

    fn on_retry_due(
        &mut self,
        due: RetryDue<K::Id>,
    ) {
        let current = self
            .entities
            .get(&due.id)
            .is_some_and(|state| state.generation == due.generation && !state.is_watching());
        if current {
            debug!(entity_kind = self.kind.name(), id = %due.id, "re-reading entity");
            self.start_watcher(&due.id);
        }
    }
}

impl<K: EntityKind> Drop for EntityMonitor<K> {
    fn drop(&mut self) {
        self.stop_all();
    }
}
