//! Device monitor: the subscriber-facing join of the id-set watch and the
//! per-entity watches of one entity kind.
//!
//! ```text
//!  session events ──┐
//!  id-set deltas  ──┼──► monitor actor ──► registry ──► per-subscriber queue ──► callbacks
//!  entity updates ──┘        ▲
//!  subscribe ────────────────┘ (replay of live entities)
//! ```
//!
//! Everything that decides what subscribers see runs on the single actor
//! task, so the per-id stream is built from one ordered source of truth:
//! `(Create Update* Delete)*`, never a Delete without a preceding Create.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::ConnectionState;
use super::DeviceEvent;
use super::EntityIdSetMonitor;
use super::EntityMonitor;
use super::EntityUpdate;
use super::IdSetEvent;
use super::ResyncPhase;
use super::Subscriber;
use super::SubscriberRegistry;
use super::SubscriptionId;
use crate::coordination::CoordinationClient;
use crate::coordination::SessionEpoch;
use crate::coordination::SessionEvent;
use crate::coordination::SessionState;
use crate::metrics::DEVICE_EVENTS;
use crate::metrics::SESSION_RESYNCS;
use crate::EntityKind;
use crate::Error;
use crate::MonitorConfig;
use crate::MonitorError;
use crate::Result;
use crate::StoreError;
use crate::WatchConfig;

type Registry<K> = SubscriberRegistry<<K as EntityKind>::Id, <K as EntityKind>::Entity>;

enum Command {
    /// Queue the replay for a freshly registered subscriber and attach it
    Attach(SubscriptionId),
}

enum Lifecycle {
    NotStarted,
    Running {
        commands: mpsc::UnboundedSender<Command>,
        actor: JoinHandle<()>,
        runtime: Handle,
    },
    Stopped,
}

/// Publishes Create/Update/Delete for every entity of kind `K`.
///
/// ```ignore
/// let monitor = HostMonitor::for_hosts(client, config);
/// let (subscriber, mut events) = ChannelSubscriber::new();
/// monitor.subscribe(subscriber)?;
/// monitor.start()?;
/// while let Some(event) = events.recv().await { /* ... */ }
/// monitor.stop().await;
/// ```
pub struct DeviceMonitor<K: EntityKind> {
    kind: Arc<K>,
    client: Arc<dyn CoordinationClient>,
    config: MonitorConfig,
    registry: Arc<Registry<K>>,
    lifecycle: Mutex<Lifecycle>,
    /// Serialises concurrent `stop` calls
    shutdown: tokio::sync::Mutex<()>,
}

impl<K: EntityKind> std::fmt::Debug for DeviceMonitor<K> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("DeviceMonitor")
            .field("kind", &self.kind.name())
            .field("collection", &self.kind.collection_path())
            .field("subscribers", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl<K: EntityKind> DeviceMonitor<K> {
    pub fn new(
        kind: K,
        client: Arc<dyn CoordinationClient>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            kind: Arc::new(kind),
            client,
            config,
            registry: Arc::new(SubscriberRegistry::new()),
            lifecycle: Mutex::new(Lifecycle::NotStarted),
            shutdown: tokio::sync::Mutex::new(()),
        }
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running { .. })
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Starts watching the store. Must be called within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::NotStarted => {}
            Lifecycle::Running { .. } => {
                error!(entity_kind = self.kind.name(), "start on a running monitor");
                return Err(MonitorError::AlreadyStarted(self.kind.name()).into());
            }
            Lifecycle::Stopped => {
                error!(entity_kind = self.kind.name(), "start on a stopped monitor");
                return Err(MonitorError::Stopped(self.kind.name()).into());
            }
        }
        let runtime = Handle::try_current()
            .map_err(|e| Error::Fatal(format!("{} monitor started outside a tokio runtime: {e}", self.kind.name())))?;

        // Subscribe to session events before reading the epoch so no
        // transition between the two is missed.
        let session = self.client.session_events();
        let epoch = self.client.current_epoch();

        self.registry.activate_all(&runtime);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let actor = MonitorActor::new(self.kind.clone(), self.client.clone(), &self.config, self.registry.clone(), epoch);
        let handle = runtime.spawn(actor.run(commands_rx, session));

        info!(
            entity_kind = self.kind.name(),
            collection = self.kind.collection_path(),
            %epoch,
            "device monitor started"
        );
        *lifecycle = Lifecycle::Running {
            commands: commands_tx,
            actor: handle,
            runtime,
        };
        Ok(())
    }

    /// Registers a subscriber.
    ///
    /// On a running monitor the subscriber first receives a Create for every
    /// live entity, then the live stream.
    pub fn subscribe(
        &self,
        subscriber: Arc<dyn Subscriber<K::Id, K::Entity>>,
    ) -> Result<SubscriptionId> {
        let lifecycle = self.lifecycle.lock();
        match &*lifecycle {
            Lifecycle::NotStarted => Ok(self.registry.register(subscriber, true, None)),
            Lifecycle::Running { commands, runtime, .. } => {
                let id = self.registry.register(subscriber, false, Some(runtime));
                if commands.send(Command::Attach(id)).is_err() {
                    self.registry.remove(id);
                    return Err(MonitorError::Stopped(self.kind.name()).into());
                }
                debug!(entity_kind = self.kind.name(), %id, "subscriber registered");
                Ok(id)
            }
            Lifecycle::Stopped => {
                error!(entity_kind = self.kind.name(), "subscribe on a stopped monitor");
                Err(MonitorError::Stopped(self.kind.name()).into())
            }
        }
    }

    /// Removes a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(
        &self,
        id: SubscriptionId,
    ) -> bool {
        self.registry.remove(id)
    }

    /// Stops every watch and waits for the subscriber delivery tasks.
    ///
    /// Idempotent. Once this returns no subscriber callback runs.
    pub async fn stop(&self) {
        let _shutdown = self.shutdown.lock().await;
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        if let Lifecycle::Running { commands, actor, .. } = previous {
            drop(commands);
            if let Err(e) = actor.await {
                error!(entity_kind = self.kind.name(), "monitor actor failed: {:?}", e);
            }
            info!(entity_kind = self.kind.name(), "device monitor stopped");
        }
        for delivery in self.registry.close_all() {
            if let Err(e) = delivery.await {
                error!(entity_kind = self.kind.name(), "subscriber delivery failed: {:?}", e);
            }
        }
    }
}

impl<K: EntityKind> Drop for DeviceMonitor<K> {
    fn drop(&mut self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        if let Lifecycle::Running { commands, .. } = previous {
            // The actor exits once the command channel closes
            drop(commands);
        }
        self.registry.close_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resync {
    Idle,
    /// Session expired, waiting for the new session to connect
    AwaitingSession,
    /// Waiting for the first id listing under the new session
    AwaitingListing,
}

struct MonitorActor<K: EntityKind> {
    kind: Arc<K>,
    client: Arc<dyn CoordinationClient>,
    config: WatchConfig,
    registry: Arc<Registry<K>>,
    id_set: EntityIdSetMonitor<K>,
    entities: EntityMonitor<K>,
    epoch: SessionEpoch,
    connection: ConnectionState,
    resync: Resync,
}

impl<K: EntityKind> MonitorActor<K> {
    fn new(
        kind: Arc<K>,
        client: Arc<dyn CoordinationClient>,
        config: &MonitorConfig,
        registry: Arc<Registry<K>>,
        epoch: SessionEpoch,
    ) -> Self {
        Self {
            id_set: EntityIdSetMonitor::new(kind.clone(), client.clone(), config.retry.store),
            entities: EntityMonitor::new(kind.clone(), client.clone(), config, epoch),
            kind,
            client,
            config: config.watch.clone(),
            registry,
            epoch,
            connection: ConnectionState::Connected,
            resync: Resync::Idle,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut session: broadcast::Receiver<SessionEvent>,
    ) {
        self.id_set.start(self.epoch);
        let mut session_open = true;

        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Attach(id)) => self.attach(id),
                    None => break,
                },
                event = session.recv(), if session_open => match event {
                    Ok(event) => self.on_session_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(entity_kind = self.kind.name(), skipped, "session events lagged");
                        self.on_session_lagged();
                    }
                    Err(RecvError::Closed) => {
                        warn!(entity_kind = self.kind.name(), "session event stream closed");
                        session_open = false;
                    }
                },
                Some(change) = self.id_set.next() => self.on_id_set_event(change),
                Some(update) = self.entities.next() => self.on_entity_update(update),
            }
        }

        self.id_set.stop();
        self.entities.stop_all();
        debug!(entity_kind = self.kind.name(), "monitor actor finished");
    }

    fn attach(
        &mut self,
        id: SubscriptionId,
    ) {
        let mut replay = Vec::new();
        if self.config.replay_on_subscribe {
            replay.extend(
                self.entities
                    .live_entities()
                    .into_iter()
                    .map(|(id, entity)| DeviceEvent::Create { id, entity }),
            );
        }
        if self.resync != Resync::Idle {
            replay.push(DeviceEvent::Resync {
                epoch: self.epoch,
                phase: ResyncPhase::Started,
            });
        }
        if self.connection != ConnectionState::Connected {
            replay.push(DeviceEvent::Connection { state: self.connection });
        }
        let replayed = replay.len();
        if self.registry.attach(id, replay) {
            debug!(entity_kind = self.kind.name(), %id, replayed, "subscriber attached");
        }
    }

    //-----------------------------------------------------------
    // Session

    fn on_session_event(
        &mut self,
        event: SessionEvent,
    ) {
        trace!(entity_kind = self.kind.name(), ?event, "session event");
        match event.state {
            SessionState::Disconnected => {
                if event.epoch == self.epoch {
                    self.set_connection(ConnectionState::Disconnected);
                }
            }
            SessionState::Expired => {
                if event.epoch > self.epoch {
                    self.begin_resync(event.epoch);
                }
            }
            SessionState::Connected => {
                if event.epoch > self.epoch {
                    // The expiry itself was not observed
                    self.begin_resync(event.epoch);
                }
                if event.epoch == self.epoch {
                    self.on_connected();
                }
            }
        }
    }

    fn on_session_lagged(&mut self) {
        let epoch = self.client.current_epoch();
        if epoch > self.epoch {
            self.begin_resync(epoch);
            // Whether the new session is up is unknown; listing retries
            // until it is.
            self.relist();
        } else if self.id_set.is_failed() {
            self.id_set.start(self.epoch);
        }
    }

    fn on_connected(&mut self) {
        match self.resync {
            Resync::AwaitingSession => self.relist(),
            Resync::AwaitingListing => {}
            Resync::Idle => {
                self.set_connection(ConnectionState::Connected);
                if self.id_set.is_failed() || !self.id_set.is_running() {
                    self.id_set.start(self.epoch);
                }
                self.entities.retry_failed();
            }
        }
    }

    fn begin_resync(
        &mut self,
        epoch: SessionEpoch,
    ) {
        info!(
            entity_kind = self.kind.name(),
            old_epoch = %self.epoch,
            new_epoch = %epoch,
            "session expired, resyncing"
        );
        SESSION_RESYNCS.with_label_values(&[self.kind.name()]).inc();
        self.epoch = epoch;
        self.id_set.suspend();
        self.entities.suspend_all(epoch);
        self.resync = Resync::AwaitingSession;
        self.set_connection(ConnectionState::Expired);
        self.emit(DeviceEvent::Resync {
            epoch,
            phase: ResyncPhase::Started,
        });
    }

    fn relist(&mut self) {
        self.id_set.start(self.epoch);
        self.resync = Resync::AwaitingListing;
    }

    fn finish_resync(&mut self) {
        self.entities.rewatch_all();
        self.resync = Resync::Idle;
        self.set_connection(ConnectionState::Connected);
        info!(
            entity_kind = self.kind.name(),
            epoch = %self.epoch,
            tracked = self.entities.tracked_count(),
            "resync completed"
        );
        self.emit(DeviceEvent::Resync {
            epoch: self.epoch,
            phase: ResyncPhase::Completed,
        });
    }

    fn set_connection(
        &mut self,
        state: ConnectionState,
    ) {
        if self.connection != state {
            self.connection = state;
            self.emit(DeviceEvent::Connection { state });
        }
    }

    //-----------------------------------------------------------
    // Watches

    fn on_id_set_event(
        &mut self,
        change: IdSetEvent<K::Id>,
    ) {
        match change {
            IdSetEvent::Changed {
                added,
                removed,
                first_listing,
            } => {
                for id in removed {
                    if self.entities.stop_watching(&id) == Some(true) {
                        self.emit(DeviceEvent::Delete { id });
                    }
                }
                for id in added {
                    self.entities.notify_on(id);
                }
                if first_listing && self.resync == Resync::AwaitingListing {
                    self.finish_resync();
                } else if self.connection == ConnectionState::Degraded {
                    self.set_connection(ConnectionState::Connected);
                }
            }
            IdSetEvent::Failed(StoreError::SessionExpired) => {
                debug!(entity_kind = self.kind.name(), "id set watch lost with the session");
            }
            IdSetEvent::Failed(error) => {
                warn!(entity_kind = self.kind.name(), ?error, "id set watch failed");
                // transient failures restart from the id set's own backoff timer
                if self.resync == Resync::Idle && self.connection == ConnectionState::Connected {
                    self.set_connection(ConnectionState::Degraded);
                }
            }
        }
    }

    fn on_entity_update(
        &mut self,
        update: EntityUpdate<K::Id, K::Entity>,
    ) {
        match update {
            EntityUpdate::Snapshot {
                id,
                entity,
                created: true,
            } => self.emit(DeviceEvent::Create { id, entity }),
            EntityUpdate::Snapshot {
                id,
                entity,
                created: false,
            } => self.emit(DeviceEvent::Update { id, entity }),
            EntityUpdate::Deleted { id } => {
                let listed = self.id_set.contains(&id);
                self.emit(DeviceEvent::Delete { id: id.clone() });
                if listed {
                    // The node went away while its id is still listed; watch
                    // for it to come back until the listing drops it.
                    self.entities.notify_on(id);
                }
            }
            EntityUpdate::Unreadable { id, error } => self.emit(DeviceEvent::Unreadable { id, error }),
        }
    }

    fn emit(
        &self,
        event: DeviceEvent<K::Id, K::Entity>,
    ) {
        DEVICE_EVENTS.with_label_values(&[self.kind.name(), event.label()]).inc();
        match event.id() {
            Some(id) => trace!(entity_kind = self.kind.name(), %id, event = event.label(), "emit"),
            None => debug!(entity_kind = self.kind.name(), ?event, "emit"),
        }
        self.registry.broadcast(&event);
    }
}
