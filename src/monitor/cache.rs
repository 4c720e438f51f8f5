use std::hash::Hash;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::ConnectionState;
use super::ResyncPhase;
use super::Subscriber;
use crate::coordination::SessionEpoch;
use crate::DecodeError;

/// Subscriber materialising the entity stream into a concurrent map.
///
/// Readers on any thread see the last delivered value of every live entity.
/// An entity whose latest payload is unreadable keeps its last good value
/// and is additionally listed by [`EntityCache::unreadable_ids`].
pub struct EntityCache<Id, T>
where
    Id: Eq + Hash,
{
    entries: DashMap<Id, Arc<T>>,
    unreadable: DashMap<Id, Arc<DecodeError>>,
    resyncing: AtomicBool,
    connection: Mutex<ConnectionState>,
}

impl<Id, T> Default for EntityCache<Id, T>
where
    Id: Eq + Hash,
{
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            unreadable: DashMap::new(),
            resyncing: AtomicBool::new(false),
            connection: Mutex::new(ConnectionState::Connected),
        }
    }
}

impl<Id, T> EntityCache<Id, T>
where
    Id: Clone + Eq + Hash + Ord,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        id: &Id,
    ) -> Option<Arc<T>> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(
        &self,
        id: &Id,
    ) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn unreadable_ids(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self.unreadable.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// True between a resync start and its completion. Values may be stale
    /// meanwhile.
    pub fn is_resyncing(&self) -> bool {
        self.resyncing.load(Ordering::Acquire)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.lock()
    }
}

impl<Id, T> Subscriber<Id, T> for EntityCache<Id, T>
where
    Id: Clone + Eq + Hash + Ord + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    fn on_create(
        &self,
        id: &Id,
        entity: Arc<T>,
    ) {
        self.unreadable.remove(id);
        self.entries.insert(id.clone(), entity);
    }

    fn on_update(
        &self,
        id: &Id,
        entity: Arc<T>,
    ) {
        self.unreadable.remove(id);
        self.entries.insert(id.clone(), entity);
    }

    fn on_delete(
        &self,
        id: &Id,
    ) {
        self.unreadable.remove(id);
        self.entries.remove(id);
    }

    fn on_unreadable(
        &self,
        id: &Id,
        error: Arc<DecodeError>,
    ) {
        self.unreadable.insert(id.clone(), error);
    }

    fn on_resync(
        &self,
        _epoch: SessionEpoch,
        phase: ResyncPhase,
    ) {
        self.resyncing.store(phase == ResyncPhase::Started, Ordering::Release);
    }

    fn on_connection_state(
        &self,
        state: ConnectionState,
    ) {
        *self.connection.lock() = state;
    }
}
