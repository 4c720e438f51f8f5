//! Watch over the set of ids of one entity kind.
//!
//! A background task lists the kind's collection with a children watch,
//! reports the listing, waits for the watch to fire and lists again. The
//! owner turns consecutive listings into added/removed deltas, so the
//! deltas always reflect the latest listing even when several firings
//! collapse into one read.
//!
//! A listing that fails on a transient store error after exhausting its
//! retries is restarted on a backoff timer, so the watch comes back without
//! waiting for a session event.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::WatchGuard;
use crate::coordination::CoordinationClient;
use crate::coordination::SessionEpoch;
use crate::metrics::WATCH_FIRINGS;
use crate::utils::retry_with_backoff;
use crate::BackoffPolicy;
use crate::EntityKind;
use crate::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdSetEvent<Id> {
    Changed {
        added: Vec<Id>,
        removed: Vec<Id>,
        /// First listing since the last (re)start
        first_listing: bool,
    },
    /// Listing failed beyond retry. Transient failures restart on their own
    /// after a backoff delay; any other failure needs an explicit restart.
    Failed(StoreError),
}

struct Listing {
    epoch: SessionEpoch,
    generation: u64,
    result: Result<BTreeSet<String>, StoreError>,
}

/// Tracks the ids present under [`EntityKind::collection_path`].
///
/// Owned and driven by a single task: the `&mut self` methods and
/// [`Self::next`] are never called concurrently.
pub struct EntityIdSetMonitor<K: EntityKind> {
    kind: Arc<K>,
    client: Arc<dyn CoordinationClient>,
    retry: BackoffPolicy,
    known: BTreeSet<K::Id>,
    epoch: SessionEpoch,
    /// Bumped on every (re)start so listings of replaced tasks are dropped
    generation: u64,
    awaiting_first: bool,
    failed: bool,
    guard: Option<WatchGuard>,
    listings_tx: mpsc::UnboundedSender<Listing>,
    listings_rx: mpsc::UnboundedReceiver<Listing>,
    /// Consecutive failed starts, reset by a successful listing
    restart_attempt: u32,
    /// Pending restart timer of a failed watch
    restart: Option<CancellationToken>,
    restart_tx: mpsc::UnboundedSender<u64>,
    restart_rx: mpsc::UnboundedReceiver<u64>,
}

impl<K: EntityKind> EntityIdSetMonitor<K> {
    pub fn new(
        kind: Arc<K>,
        client: Arc<dyn CoordinationClient>,
        retry: BackoffPolicy,
    ) -> Self {
        let (listings_tx, listings_rx) = mpsc::unbounded_channel();
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        Self {
            kind,
            client,
            retry,
            known: BTreeSet::new(),
            epoch: SessionEpoch::default(),
            generation: 0,
            awaiting_first: false,
            failed: false,
            guard: None,
            listings_tx,
            listings_rx,
            restart_attempt: 0,
            restart: None,
            restart_tx,
            restart_rx,
        }
    }

    /// Starts watching under `epoch`. The known set is kept, so the first
    /// listing after a restart reports the difference to what was known.
    pub fn start(
        &mut self,
        epoch: SessionEpoch,
    ) {
        self.suspend();
        self.epoch = epoch;
        self.generation += 1;
        self.awaiting_first = true;
        self.failed = false;

        let guard = WatchGuard::new();
        let task = ChildrenWatchTask {
            kind_name: self.kind.name(),
            path: self.kind.collection_path().to_string(),
            client: self.client.clone(),
            epoch,
            generation: self.generation,
            retry: self.retry,
            guard: guard.clone(),
            listings: self.listings_tx.clone(),
        };
        debug!(
            entity_kind = self.kind.name(),
            %epoch,
            generation = self.generation,
            "id set watch started"
        );
        tokio::spawn(task.run());
        self.guard = Some(guard);
    }

    /// Stops the watch task but keeps the known set
    pub fn suspend(&mut self) {
        if let Some(restart) = self.restart.take() {
            restart.cancel();
        }
        if let Some(guard) = self.guard.take() {
            guard.stop(self.client.as_ref());
        }
    }

    /// Stops watching and forgets every known id
    pub fn stop(&mut self) {
        self.suspend();
        self.known.clear();
    }

    pub fn is_running(&self) -> bool {
        self.guard.as_ref().is_some_and(WatchGuard::is_live)
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn contains(
        &self,
        id: &K::Id,
    ) -> bool {
        self.known.contains(id)
    }

    pub fn known(&self) -> &BTreeSet<K::Id> {
        &self.known
    }

    /// Waits for the next id-set change. Cancel safe.
    pub async fn next(&mut self) -> Option<IdSetEvent<K::Id>> {
        loop {
            let listing = tokio::select! {
                Some(generation) = self.restart_rx.recv() => {
                    self.on_restart_due(generation);
                    continue;
                }
                listing = self.listings_rx.recv() => listing?,
            };
            if listing.generation != self.generation || listing.epoch != self.epoch {
                trace!(
                    entity_kind = self.kind.name(),
                    generation = listing.generation,
                    "dropping listing of a replaced watch"
                );
                continue;
            }

            let children = match listing.result {
                Ok(children) => children,
                Err(error) => {
                    self.failed = true;
                    self.guard = None;
                    if error.is_transient() {
                        self.schedule_restart();
                    }
                    return Some(IdSetEvent::Failed(error));
                }
            };
            self.restart_attempt = 0;

            let current = self.parse_ids(&children);
            let added: Vec<K::Id> = current.difference(&self.known).cloned().collect();
            let removed: Vec<K::Id> = self.known.difference(&current).cloned().collect();
            let first_listing = std::mem::take(&mut self.awaiting_first);
            self.known = current;

            if added.is_empty() && removed.is_empty() && !first_listing {
                continue;
            }
            trace!(
                entity_kind = self.kind.name(),
                added = added.len(),
                removed = removed.len(),
                first_listing,
                "id set changed"
            );
            return Some(IdSetEvent::Changed {
                added,
                removed,
                first_listing,
            });
        }
    }

    fn schedule_restart(&mut self) {
        let delay = self.retry.delay_for(self.restart_attempt);
        self.restart_attempt = self.restart_attempt.saturating_add(1);
        debug!(
            entity_kind = self.kind.name(),
            ?delay,
            attempt = self.restart_attempt,
            "id set watch restart scheduled"
        );

        let cancel = CancellationToken::new();
        let timer = cancel.clone();
        let restart_tx = self.restart_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = restart_tx.send(generation);
                }
            }
        });
        self.restart = Some(cancel);
    }

    fn on_restart_due(
        &mut self,
        generation: u64,
    ) {
        if generation != self.generation || !self.failed {
            return;
        }
        debug!(entity_kind = self.kind.name(), epoch = %self.epoch, "restarting failed id set watch");
        let epoch = self.epoch;
        self.start(epoch);
    }

    fn parse_ids(
        &self,
        children: &BTreeSet<String>,
    ) -> BTreeSet<K::Id> {
        children
            .iter()
            .filter_map(|child| match self.kind.parse_id(child) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(entity_kind = self.kind.name(), %e, "skipping child");
                    None
                }
            })
            .collect()
    }
}

impl<K: EntityKind> Drop for EntityIdSetMonitor<K> {
    fn drop(&mut self) {
        self.suspend();
    }
}

struct ChildrenWatchTask {
    kind_name: &'static str,
    path: String,
    client: Arc<dyn CoordinationClient>,
    epoch: SessionEpoch,
    generation: u64,
    retry: BackoffPolicy,
    guard: WatchGuard,
    listings: mpsc::UnboundedSender<Listing>,
}

impl ChildrenWatchTask {
    async fn run(self) {
        let (sink, mut fired_rx) = mpsc::unbounded_channel();

        loop {
            let result = {
                let client = self.client.as_ref();
                let path = self.path.as_str();
                let sink = &sink;
                tokio::select! {
                    biased;
                    _ = self.guard.cancelled() => return,
                    result = retry_with_backoff(&self.retry, path, move || {
                        client.list_children_and_watch(path, sink.clone())
                    }) => result,
                }
            };

            let (children, token) = match result {
                Ok(listed) => listed,
                Err(error) => {
                    warn!(entity_kind = self.kind_name, path = %self.path, ?error, "id set watch failed");
                    self.report(Err(error));
                    return;
                }
            };
            if !self.guard.arm(self.client.as_ref(), token) {
                return;
            }
            if token.epoch() != self.epoch {
                self.guard.stop(self.client.as_ref());
                return;
            }

            self.report(Ok(children));

            if !self.guard.wait_for_fire(&mut fired_rx, token).await {
                return;
            }
            WATCH_FIRINGS.with_label_values(&[self.kind_name, "children"]).inc();
        }
    }

    fn report(
        &self,
        result: Result<BTreeSet<String>, StoreError>,
    ) {
        if !self.guard.is_live() {
            return;
        }
        let _ = self.listings.send(Listing {
            epoch: self.epoch,
            generation: self.generation,
            result,
        });
    }
}
