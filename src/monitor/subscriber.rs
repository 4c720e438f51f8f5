//! Subscriber callbacks and per-subscriber delivery.
//!
//! Each subscriber gets its own queue drained by its own task, so a slow
//! subscriber never holds back the monitor or its peers. The monitor only
//! enqueues; callbacks for one subscriber run strictly in enqueue order.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::ConnectionState;
use super::DeviceEvent;
use super::ResyncPhase;
use super::SubscriptionId;
use crate::coordination::SessionEpoch;
use crate::DecodeError;

/// Receives the entity stream of one [`crate::DeviceMonitor`].
///
/// Callbacks run on a delivery task owned by the monitor and must not block
/// for long. Only the three entity callbacks are required.
pub trait Subscriber<Id, T>: Send + Sync + 'static {
    fn on_create(
        &self,
        id: &Id,
        entity: Arc<T>,
    );

    fn on_update(
        &self,
        id: &Id,
        entity: Arc<T>,
    );

    fn on_delete(
        &self,
        id: &Id,
    );

    fn on_unreadable(
        &self,
        _id: &Id,
        _error: Arc<DecodeError>,
    ) {
    }

    fn on_resync(
        &self,
        _epoch: SessionEpoch,
        _phase: ResyncPhase,
    ) {
    }

    fn on_connection_state(
        &self,
        _state: ConnectionState,
    ) {
    }
}

pub(crate) fn dispatch<Id, T>(
    subscriber: &dyn Subscriber<Id, T>,
    event: DeviceEvent<Id, T>,
) where
    Id: 'static,
    T: 'static,
{
    match event {
        DeviceEvent::Create { id, entity } => subscriber.on_create(&id, entity),
        DeviceEvent::Update { id, entity } => subscriber.on_update(&id, entity),
        DeviceEvent::Delete { id } => subscriber.on_delete(&id),
        DeviceEvent::Unreadable { id, error } => subscriber.on_unreadable(&id, error),
        DeviceEvent::Resync { epoch, phase } => subscriber.on_resync(epoch, phase),
        DeviceEvent::Connection { state } => subscriber.on_connection_state(state),
    }
}

/// Subscriber forwarding every callback into an unbounded channel
pub struct ChannelSubscriber<Id, T> {
    tx: mpsc::UnboundedSender<DeviceEvent<Id, T>>,
}

impl<Id, T> ChannelSubscriber<Id, T>
where
    Id: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DeviceEvent<Id, T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(
        &self,
        event: DeviceEvent<Id, T>,
    ) {
        // Receiver dropped: nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl<Id, T> Subscriber<Id, T> for ChannelSubscriber<Id, T>
where
    Id: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    fn on_create(
        &self,
        id: &Id,
        entity: Arc<T>,
    ) {
        self.forward(DeviceEvent::Create { id: id.clone(), entity });
    }

    fn on_update(
        &self,
        id: &Id,
        entity: Arc<T>,
    ) {
        self.forward(DeviceEvent::Update { id: id.clone(), entity });
    }

    fn on_delete(
        &self,
        id: &Id,
    ) {
        self.forward(DeviceEvent::Delete { id: id.clone() });
    }

    fn on_unreadable(
        &self,
        id: &Id,
        error: Arc<DecodeError>,
    ) {
        self.forward(DeviceEvent::Unreadable { id: id.clone(), error });
    }

    fn on_resync(
        &self,
        epoch: SessionEpoch,
        phase: ResyncPhase,
    ) {
        self.forward(DeviceEvent::Resync { epoch, phase });
    }

    fn on_connection_state(
        &self,
        state: ConnectionState,
    ) {
        self.forward(DeviceEvent::Connection { state });
    }
}

struct SubscriberSlot<Id, T> {
    subscriber: Arc<dyn Subscriber<Id, T>>,
    tx: mpsc::UnboundedSender<DeviceEvent<Id, T>>,
    /// Present until the delivery task is spawned
    rx: Option<mpsc::UnboundedReceiver<DeviceEvent<Id, T>>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    /// Whether the slot receives broadcasts. A slot registered on a running
    /// monitor stays detached until the monitor has queued its replay.
    attached: bool,
}

impl<Id, T> SubscriberSlot<Id, T>
where
    Id: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    fn new(
        subscriber: Arc<dyn Subscriber<Id, T>>,
        attached: bool,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            subscriber,
            tx,
            rx: Some(rx),
            cancel: CancellationToken::new(),
            handle: None,
            attached,
        }
    }

    fn activate(
        &mut self,
        runtime: &Handle,
    ) {
        if let Some(rx) = self.rx.take() {
            let subscriber = self.subscriber.clone();
            let cancel = self.cancel.clone();
            self.handle = Some(runtime.spawn(deliver(subscriber, rx, cancel)));
        }
    }

    fn close(mut self) -> Option<JoinHandle<()>> {
        self.cancel.cancel();
        self.handle.take()
    }
}

async fn deliver<Id, T>(
    subscriber: Arc<dyn Subscriber<Id, T>>,
    mut rx: mpsc::UnboundedReceiver<DeviceEvent<Id, T>>,
    cancel: CancellationToken,
) where
    Id: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if cancel.is_cancelled() {
            break;
        }
        dispatch(subscriber.as_ref(), event);
    }
    trace!("subscriber delivery finished");
}

/// Subscribers of one monitor
pub(crate) struct SubscriberRegistry<Id, T> {
    slots: Mutex<BTreeMap<SubscriptionId, SubscriberSlot<Id, T>>>,
    /// Delivery tasks of removed subscribers that may still be mid-callback
    retired: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl<Id, T> SubscriberRegistry<Id, T>
where
    Id: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
            retired: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Adds a subscriber. Its delivery task starts on `runtime`, or on
    /// [`Self::activate_all`] when no runtime is given yet.
    pub(crate) fn register(
        &self,
        subscriber: Arc<dyn Subscriber<Id, T>>,
        attached: bool,
        runtime: Option<&Handle>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut slot = SubscriberSlot::new(subscriber, attached);
        if let Some(runtime) = runtime {
            slot.activate(runtime);
        }
        self.slots.lock().insert(id, slot);
        id
    }

    pub(crate) fn activate_all(
        &self,
        runtime: &Handle,
    ) {
        for slot in self.slots.lock().values_mut() {
            slot.activate(runtime);
        }
    }

    /// Queues `replay` to a detached subscriber and starts broadcasting to
    /// it. Returns false if the subscriber is gone.
    pub(crate) fn attach(
        &self,
        id: SubscriptionId,
        replay: impl IntoIterator<Item = DeviceEvent<Id, T>>,
    ) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&id) else {
            return false;
        };
        for event in replay {
            let _ = slot.tx.send(event);
        }
        slot.attached = true;
        true
    }

    /// Removes a subscriber. A callback already running completes; no
    /// further callback starts. Its delivery task is still awaited by
    /// [`Self::close_all`].
    pub(crate) fn remove(
        &self,
        id: SubscriptionId,
    ) -> bool {
        let slot = self.slots.lock().remove(&id);
        match slot {
            Some(slot) => {
                if let Some(handle) = slot.close() {
                    let mut retired = self.retired.lock();
                    retired.retain(|h| !h.is_finished());
                    retired.push(handle);
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn broadcast(
        &self,
        event: &DeviceEvent<Id, T>,
    ) {
        for slot in self.slots.lock().values() {
            if slot.attached {
                let _ = slot.tx.send(event.clone());
            }
        }
    }

    /// Removes every subscriber and returns their delivery tasks, including
    /// those of subscribers removed earlier
    pub(crate) fn close_all(&self) -> Vec<JoinHandle<()>> {
        let slots = std::mem::take(&mut *self.slots.lock());
        let mut handles: Vec<_> = slots.into_values().filter_map(SubscriberSlot::close).collect();
        handles.append(&mut *self.retired.lock());
        handles
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }
}
