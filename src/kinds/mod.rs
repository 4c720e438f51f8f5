//! Entity kinds: the per-kind capability the generic monitors are
//! parameterised with.
//!
//! A kind names where its entities live in the store and how to turn a child
//! name into an id and a payload into a typed value. Everything else (watch
//! management, dedup, ordering, session handling) is shared.

mod bridge;
mod host;
mod vtep;
pub use bridge::*;
pub use host::*;
pub use vtep::*;


use std::fmt::Debug;
use std::fmt::Display;
use std::hash::Hash;

use serde::de::DeserializeOwned;

use crate::DecodeError;

pub trait EntityKind: Send + Sync + 'static {
    type Id: Clone + Eq + Hash + Ord + Debug + Display + Send + Sync + 'static;
    type Entity: Debug + PartialEq + Send + Sync + 'static;

    /// Short label used in logs and metrics
    fn name(&self) -> &'static str;

    /// Path whose children are the ids of this kind
    fn collection_path(&self) -> &str;

    /// Path holding the payload of one entity
    fn node_path(
        &self,
        id: &Self::Id,
    ) -> String {
        format!("{}/{}", self.collection_path(), id)
    }

    fn parse_id(
        &self,
        child: &str,
    ) -> Result<Self::Id, DecodeError>;

    fn decode(
        &self,
        id: &Self::Id,
        payload: &[u8],
    ) -> Result<Self::Entity, DecodeError>;
}

/// JSON decoding shared by the built-in kinds
pub(crate) fn decode_json<T: DeserializeOwned>(
    path: String,
    payload: &[u8],
) -> Result<T, DecodeError> {
    serde_json::from_slice(payload).map_err(|source| DecodeError::Malformed { path, source })
}

pub(crate) fn parse_child<T>(child: &str) -> Result<T, DecodeError>
where
    T: std::str::FromStr,
    T::Err: Display,
{
    child.parse().map_err(|e: T::Err| DecodeError::InvalidId {
        child: child.to_string(),
        reason: e.to_string(),
    })
}
