//! Entity Monitoring Error Hierarchy
//!
//! Errors are split by the layer that produces them: the coordination store
//! session, payload decoding, and monitor lifecycle misuse.

use std::time::Duration;

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Coordination store failures (session, connectivity, node state)
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Entity payload or identifier could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Monitor lifecycle misuse
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unrecoverable failures
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Connection to the store dropped; the session may still be alive
    #[error("Connection to coordination store lost")]
    ConnectionLoss,

    /// A single store call did not complete in time
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The session is gone and every watch registered under it with it
    #[error("Coordination session expired")]
    SessionExpired,

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    /// Client handle was closed
    #[error("Coordination client closed")]
    Closed,
}

impl StoreError {
    /// Whether re-issuing the same call may succeed without operator action
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::ConnectionLoss | StoreError::Timeout(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Payload stored at `path` is not a valid entity document
    #[error("Malformed payload at {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// Child name under a collection is not a valid identifier
    #[error("Invalid entity id {child:?}: {reason}")]
    InvalidId { child: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    #[error("Monitor for {0} already started")]
    AlreadyStarted(&'static str),

    #[error("Monitor for {0} is stopped")]
    Stopped(&'static str),
}
