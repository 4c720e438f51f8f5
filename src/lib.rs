//! # topology-monitor
//!
//! Replicates entity collections held in a hierarchical coordination store
//! (ZooKeeper semantics) into ordered per-entity Create/Update/Delete
//! streams.
//!
//! The store only offers one-shot watches and sessions that can expire. The
//! monitors in this crate hide both: every subscriber sees, per entity id,
//! `(Create Update* Delete)*`, with unchanged re-reads suppressed and a full
//! resync after a session expiry that only reports real differences.
//!
//! ## Building blocks
//!
//! - [`CoordinationClient`] - read side of the store: list-and-watch,
//!   read-and-watch, session events
//! - [`EntityKind`] - where one kind of entity lives and how to decode it
//! - [`DeviceMonitor`] - the subscriber-facing monitor for one kind
//! - [`Subscriber`], [`ChannelSubscriber`], [`EntityCache`] - consumers
//!
//! ## Example
//!
//! ```ignore
//! let config = MonitorConfig::new()?.validate()?;
//! let store = Arc::new(MemoryCoordinationStore::new());
//! let hosts = HostMonitor::for_hosts(store.clone(), config);
//! let cache = Arc::new(EntityCache::new());
//! hosts.subscribe(cache.clone())?;
//! hosts.start()?;
//! ```

mod config;
pub mod coordination;
mod errors;
mod kinds;
pub mod metrics;
mod monitor;
mod utils;

pub use config::*;
pub use coordination::CoordinationClient;
pub use coordination::MemoryCoordinationStore;
pub use coordination::SessionEpoch;
pub use coordination::SessionEvent;
pub use coordination::SessionState;
pub use coordination::WatchFired;
pub use coordination::WatchKind;
pub use coordination::WatchSink;
pub use coordination::WatchToken;
pub use errors::*;
pub use kinds::*;
pub use monitor::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
