//! RoomId: Identifier of a broadcast group of peers editing the same resource.
//!
//! Room ids are opaque strings. For documents they are derived from the
//! resource's storage key with a one-way hash, so every peer that opens the
//! same resource computes the same room without a discovery service.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Domain prefix mixed into room id derivation.
const ROOM_DOMAIN: &str = "collab-room:v1:";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomIdError {
    #[error("Room ID must not be empty")]
    Empty,
}

/// Opaque identifier of a collaboration room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Wrap an existing room id. Rejects empty or whitespace-only ids.
    pub fn new(id: impl Into<String>) -> Result<Self, RoomIdError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(RoomIdError::Empty);
        }
        Ok(Self(id))
    }

    /// Derive the room id for a resource (e.g. a pad's storage key).
    ///
    /// Lowercase hex SHA-256 of a fixed domain prefix plus the key.
    pub fn derive(resource_key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(ROOM_DOMAIN.as_bytes());
        hasher.update(resource_key.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RoomId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RoomId {
    type Error = RoomIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> String {
        id.0
    }
}
