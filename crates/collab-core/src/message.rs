//! Wire messages exchanged inside a collaboration room.
//!
//! Every frame on the wire carries one [`Envelope`]: the sender's session id
//! plus a [`SyncMessage`]. Envelopes are JSON, internally tagged by `type`,
//! with binary payloads as base64 strings:
//!
//! ```text
//! {"senderId":"00000000000004d2","type":"update","bytes":"AAEC..."}
//! ```

use crate::sender::SenderId;
use serde::{Deserialize, Serialize};

/// Messages of the replication protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncMessage {
    /// "Give me everything you have that I don't."
    RequestSnapshot {
        /// Encoded version vector of the requester's oplog
        #[serde(with = "base64_bytes")]
        version: Vec<u8>,
    },

    /// Full or partial state export answering a `RequestSnapshot`.
    SendSnapshot {
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },

    /// Incremental document delta from a local edit.
    Update {
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },

    /// Ephemeral delta for cursor/selection presence.
    CursorUpdate {
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },

    /// Ephemeral delta for user presence (display name, liveness).
    UserUpdate {
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },

    /// Full snapshot meant for durable storage, not for peer replay.
    SendState {
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
}

impl SyncMessage {
    /// The wire tag of this message, e.g. `"request-snapshot"`.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::RequestSnapshot { .. } => "request-snapshot",
            SyncMessage::SendSnapshot { .. } => "send-snapshot",
            SyncMessage::Update { .. } => "update",
            SyncMessage::CursorUpdate { .. } => "cursor-update",
            SyncMessage::UserUpdate { .. } => "user-update",
            SyncMessage::SendState { .. } => "send-state",
        }
    }

    /// Whether peers replay this message. `send-state` is storage-only.
    pub fn is_peer_replicated(&self) -> bool {
        !matches!(self, SyncMessage::SendState { .. })
    }

    /// Size of the carried payload in bytes.
    pub fn payload_len(&self) -> usize {
        match self {
            SyncMessage::RequestSnapshot { version } => version.len(),
            SyncMessage::SendSnapshot { bytes }
            | SyncMessage::Update { bytes }
            | SyncMessage::CursorUpdate { bytes }
            | SyncMessage::UserUpdate { bytes }
            | SyncMessage::SendState { bytes } => bytes.len(),
        }
    }
}

/// A message plus the id of the session that sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "senderId")]
    pub sender_id: SenderId,

    #[serde(flatten)]
    pub message: SyncMessage,
}

impl Envelope {
    pub fn new(sender_id: SenderId, message: SyncMessage) -> Self {
        Self { sender_id, message }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Serde adapter encoding `Vec<u8>` as a standard base64 string.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
