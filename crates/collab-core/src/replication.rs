//! Replicator: per-room, per-peer replication state machine.
//!
//! The machine is sans-IO: it consumes decoded [`SyncMessage`]s and returns
//! the message to send back, if any. The session layer owns the channel and
//! the timers.
//!
//! ```text
//! Uninitialized --on_connect--> AwaitingSnapshot --send-snapshot--> Synced
//!                                     ^                                |
//!                                     +-----------on_connect-----------+
//! ```
//!
//! Snapshot replies are broadcast on the room, so every peer ingests replies
//! to requests it never made. Import is idempotent, so that is only wasteful.

use crate::document::{DocumentError, SharedDocument};
use crate::ephemeral::EphemeralError;
use crate::message::SyncMessage;
use crate::presence::{Presence, PresenceKind};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Presence error: {0}")]
    Presence(#[from] EphemeralError),
}

pub type Result<T> = std::result::Result<T, ReplicationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationState {
    Uninitialized,
    AwaitingSnapshot,
    Synced,
}

pub struct Replicator {
    document: SharedDocument,
    presence: Presence,
    state: ReplicationState,
}

impl Replicator {
    pub fn new(document: SharedDocument, presence: Presence) -> Self {
        Self {
            document,
            presence,
            state: ReplicationState::Uninitialized,
        }
    }

    pub fn state(&self) -> ReplicationState {
        self.state
    }

    pub fn document(&self) -> &SharedDocument {
        &self.document
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// Channel (re)connected: ask the room for everything we are missing.
    pub fn on_connect(&mut self) -> SyncMessage {
        self.state = ReplicationState::AwaitingSnapshot;
        let version = self.document.encoded_version();
        debug!("Requesting snapshot from version ({} bytes)", version.len());
        SyncMessage::RequestSnapshot { version }
    }

    /// Apply one inbound message. Returns the reply to send, if any.
    pub fn handle(&mut self, message: SyncMessage) -> Result<Option<SyncMessage>> {
        trace!(
            "Handling {} ({} bytes)",
            message.kind(),
            message.payload_len()
        );
        match message {
            SyncMessage::RequestSnapshot { version } => {
                let bytes = self.document.export_updates_from_encoded(&version)?;
                Ok(Some(SyncMessage::SendSnapshot { bytes }))
            }
            SyncMessage::SendSnapshot { bytes } => {
                let changed = self.document.import(&bytes)?;
                if self.state != ReplicationState::Synced {
                    debug!("Snapshot received (changed: {}), synced", changed);
                }
                self.state = ReplicationState::Synced;
                Ok(None)
            }
            SyncMessage::Update { bytes } => {
                self.document.import(&bytes)?;
                Ok(None)
            }
            SyncMessage::CursorUpdate { bytes } => {
                self.presence.apply(PresenceKind::Cursor, &bytes)?;
                Ok(None)
            }
            SyncMessage::UserUpdate { bytes } => {
                self.presence.apply(PresenceKind::User, &bytes)?;
                Ok(None)
            }
            SyncMessage::SendState { bytes } => {
                // Storage-only; replaying it would count as a peer edit
                trace!("Ignoring send-state ({} bytes) from peer", bytes.len());
                Ok(None)
            }
        }
    }

    /// Wrap a local document delta for broadcast.
    pub fn local_update(&self, bytes: &[u8]) -> SyncMessage {
        SyncMessage::Update {
            bytes: bytes.to_vec(),
        }
    }

    pub fn local_presence(&self, kind: PresenceKind, bytes: &[u8]) -> SyncMessage {
        kind.message(bytes.to_vec())
    }

    /// Periodic durable flush: a full snapshot, only when ops are pending.
    pub fn flush_state(&self) -> Result<Option<SyncMessage>> {
        Ok(self
            .document
            .take_flush_snapshot()?
            .map(|bytes| SyncMessage::SendState { bytes }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn replicator(name: &str) -> Replicator {
        Replicator::new(
            SharedDocument::new(),
            Presence::new(name, Duration::from_secs(30)),
        )
    }

    #[test]
    fn test_state_transitions() {
        let mut a = replicator("a");
        let b = replicator("b");
        assert_eq!(a.state(), ReplicationState::Uninitialized);

        let request = a.on_connect();
        assert!(matches!(request, SyncMessage::RequestSnapshot { .. }));
        assert_eq!(a.state(), ReplicationState::AwaitingSnapshot);

        let snapshot = SyncMessage::SendSnapshot {
            bytes: b.document().export_snapshot().unwrap(),
        };
        assert!(a.handle(snapshot).unwrap().is_none());
        assert_eq!(a.state(), ReplicationState::Synced);

        a.on_connect();
        assert_eq!(a.state(), ReplicationState::AwaitingSnapshot);
    }

    #[test]
    fn test_always_answers_snapshot_requests() {
        let mut a = replicator("a");
        let reply = a
            .handle(SyncMessage::RequestSnapshot { version: vec![] })
            .unwrap();
        assert!(matches!(reply, Some(SyncMessage::SendSnapshot { .. })));
    }

    #[test]
    fn test_send_state_is_not_imported() {
        let source = replicator("src");
        source.document().insert_text("body", 0, "persisted").unwrap();
        let state = source.flush_state().unwrap().unwrap();

        let mut peer = replicator("peer");
        assert!(peer.handle(state).unwrap().is_none());
        assert_eq!(peer.document().text_content("body"), "");
        assert!(!peer.document().has_unflushed_ops());
    }

    #[test]
    fn test_flush_state_only_when_dirty() {
        let r = replicator("a");
        assert!(r.flush_state().unwrap().is_none());

        r.document().insert_text("body", 0, "x").unwrap();
        let flushed = r.flush_state().unwrap();
        assert!(matches!(flushed, Some(SyncMessage::SendState { .. })));
        assert!(r.flush_state().unwrap().is_none());
    }

    #[test]
    fn test_presence_messages_routed() {
        let a = replicator("alice");
        let mut b = replicator("bob");
        a.presence().set_user(&crate::presence::UserState {
            name: "Alice".into(),
            color: "red".into(),
        });
        let delta = a.presence().store(PresenceKind::User).encode_all().unwrap();

        b.handle(a.local_presence(PresenceKind::User, &delta)).unwrap();
        assert!(b.presence().users().contains_key("alice"));
        assert!(b.presence().cursors().is_empty());
    }

    #[test]
    fn test_corrupt_update_reports_error() {
        let mut a = replicator("a");
        let err = a
            .handle(SyncMessage::Update {
                bytes: b"garbage".to_vec(),
            })
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Document(_)));

        let err = a
            .handle(SyncMessage::CursorUpdate { bytes: vec![0xff] })
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Presence(_)));
    }
}
