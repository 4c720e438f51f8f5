use serde::Deserialize;
use serde::Serialize;

use crate::Result;

/// Staleness signal used to suppress no-op updates.
///
/// Decoding is assumed deterministic for the built-in entity kinds, so the
/// decoded value is compared by default. Kinds whose decoded form carries
/// volatile data (timestamps, counters) should compare the raw payload.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Structural equality of the decoded entity
    #[default]
    Decoded,
    /// Byte equality of the undecoded payload
    RawPayload,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchConfig {
    /// How consecutive snapshots of one entity are compared
    ///
    /// **Default**: `decoded`
    #[serde(default)]
    pub dedup: DedupPolicy,

    /// Replay `Create` for every live entity to a subscriber added after start
    ///
    /// Without replay a late subscriber may see `Update` for an entity it was
    /// never told about.
    ///
    /// **Default**: true
    #[serde(default = "default_replay_on_subscribe")]
    pub replay_on_subscribe: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dedup: DedupPolicy::default(),
            replay_on_subscribe: default_replay_on_subscribe(),
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<()> {
        Ok(())
    }
}

const fn default_replay_on_subscribe() -> bool {
    true
}
