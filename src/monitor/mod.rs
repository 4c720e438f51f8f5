//! Monitors turning one-shot store watches into ordered entity streams.
//!
//! - [`EntityIdSetMonitor`] follows which ids of a kind exist
//! - [`EntityMonitor`] follows the payload of each tracked id
//! - [`DeviceMonitor`] joins both and fans the result out to [`Subscriber`]s

mod cache;
mod data_watcher;
mod device;
mod entity;
mod event;
mod id_set;
mod subscriber;
mod watch_guard;

pub use cache::*;
pub(crate) use data_watcher::*;
pub use device::*;
pub use entity::*;
pub use event::*;
pub use id_set::*;
pub use subscriber::*;
pub(crate) use watch_guard::*;

#[cfg(test)]
mod device_test;
