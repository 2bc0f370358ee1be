//! What happens to a posted frame.
//!
//! With the client boundary the body is opaque and goes straight to the room.
//! With the server boundary the body must be a plain envelope:
//! - `send-state` is merged into the state store and not broadcast
//! - `request-snapshot` is broadcast, then answered from the store if it
//!   holds anything for the room
//! - everything else is broadcast unchanged

use std::sync::Arc;

use collab_core::{
    CodecError, DocumentError, Envelope, FrameCodec, RoomId, RoomRegistry, SenderId, SyncMessage,
};
use thiserror::Error;

use crate::config::EncryptionBoundary;
use crate::state_store::{StateStore, StateStoreError};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(#[from] CodecError),

    #[error("State store error: {0}")]
    Store(#[from] StateStoreError),

    #[error("Failed to export stored state: {0}")]
    Export(#[from] DocumentError),
}

impl RelayError {
    /// Whether the poster is at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RelayError::InvalidEnvelope(_) | RelayError::Store(StateStoreError::Document(_))
        )
    }
}

pub struct Relay {
    registry: RoomRegistry,
    boundary: EncryptionBoundary,
    store: Arc<dyn StateStore>,
    sender_id: SenderId,
}

impl Relay {
    pub fn new(
        registry: RoomRegistry,
        boundary: EncryptionBoundary,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let sender_id = SenderId::generate();
        tracing::debug!("Relay sender id: {}", sender_id);
        Self {
            registry,
            boundary,
            store,
            sender_id,
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn boundary(&self) -> EncryptionBoundary {
        self.boundary
    }

    /// Sender id used for snapshots the relay answers itself.
    pub fn sender_id(&self) -> SenderId {
        self.sender_id
    }

    /// Handle one posted body. Returns the number of subscribers reached.
    pub fn accept(&self, room: &RoomId, body: String) -> Result<usize, RelayError> {
        match self.boundary {
            EncryptionBoundary::Client => Ok(self.registry.publish(room, body)),
            EncryptionBoundary::Server => self.accept_plain(room, body),
        }
    }

    fn accept_plain(&self, room: &RoomId, body: String) -> Result<usize, RelayError> {
        let envelope = FrameCodec::Plain.decode(&body)?;
        tracing::trace!(
            "{} from {} in room {}",
            envelope.message.kind(),
            envelope.sender_id,
            room
        );

        match &envelope.message {
            SyncMessage::SendState { bytes } => {
                self.store.save(room, bytes)?;
                Ok(0)
            }
            SyncMessage::RequestSnapshot { version } => {
                let mut reached = self.registry.publish(room, body);
                if let Some(reply) = self.stored_snapshot(room, version)? {
                    reached += self.registry.publish(room, reply);
                }
                Ok(reached)
            }
            _ => Ok(self.registry.publish(room, body)),
        }
    }

    fn stored_snapshot(&self, room: &RoomId, version: &[u8]) -> Result<Option<String>, RelayError> {
        let Some(document) = self.store.load(room)? else {
            return Ok(None);
        };
        let bytes = document.export_updates_from_encoded(version)?;
        let envelope = Envelope::new(self.sender_id, SyncMessage::SendSnapshot { bytes });
        tracing::debug!("Answering snapshot request in room {} from stored state", room);
        Ok(Some(FrameCodec::Plain.encode(&envelope)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::MemoryStateStore;
    use collab_core::{Delivery, Frame, SharedDocument};
    use std::sync::Mutex;

    fn relay(boundary: EncryptionBoundary) -> (Relay, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        let relay = Relay::new(RoomRegistry::new(), boundary, store.clone());
        (relay, store)
    }

    fn listen(relay: &Relay, room: &RoomId) -> (collab_core::RoomSubscription, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sub = relay.registry().subscribe(room, move |frame: &Frame| {
            sink_seen.lock().unwrap().push(frame.to_string());
            Delivery::Accepted
        });
        (sub, seen)
    }

    fn plain(message: SyncMessage) -> String {
        FrameCodec::Plain
            .encode(&Envelope::new(SenderId::from(7), message))
            .unwrap()
    }

    #[test]
    fn test_client_boundary_forwards_opaque_bodies() {
        let (relay, _) = relay(EncryptionBoundary::Client);
        let room = RoomId::new("r").unwrap();
        let (_sub, seen) = listen(&relay, &room);

        assert_eq!(relay.accept(&room, "opaque".into()).unwrap(), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["opaque"]);
    }

    #[test]
    fn test_server_boundary_rejects_non_envelopes() {
        let (relay, _) = relay(EncryptionBoundary::Server);
        let room = RoomId::new("r").unwrap();
        let err = relay.accept(&room, "opaque".into()).unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn test_send_state_is_stored_not_broadcast() {
        let (relay, store) = relay(EncryptionBoundary::Server);
        let room = RoomId::new("r").unwrap();
        let (_sub, seen) = listen(&relay, &room);

        let doc = SharedDocument::new();
        doc.insert_text("body", 0, "saved").unwrap();
        let body = plain(SyncMessage::SendState {
            bytes: doc.export_snapshot().unwrap(),
        });

        assert_eq!(relay.accept(&room, body).unwrap(), 0);
        assert!(seen.lock().unwrap().is_empty());
        let stored = store.load(&room).unwrap().unwrap();
        assert_eq!(stored.text_content("body"), "saved");
    }

    #[test]
    fn test_snapshot_request_answered_from_store() {
        let (relay, store) = relay(EncryptionBoundary::Server);
        let room = RoomId::new("r").unwrap();
        let doc = SharedDocument::new();
        doc.insert_text("body", 0, "from store").unwrap();
        store.save(&room, &doc.export_snapshot().unwrap()).unwrap();

        let (_sub, seen) = listen(&relay, &room);
        let request = plain(SyncMessage::RequestSnapshot {
            version: SharedDocument::new().encoded_version(),
        });
        assert_eq!(relay.accept(&room, request.clone()).unwrap(), 2);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], request);
        let reply = FrameCodec::Plain.decode(&seen[1]).unwrap();
        assert_eq!(reply.sender_id, relay.sender_id());
        let SyncMessage::SendSnapshot { bytes } = reply.message else {
            panic!("Expected send-snapshot, got {:?}", reply.message);
        };
        assert_eq!(
            SharedDocument::from_bytes(&bytes).unwrap().text_content("body"),
            "from store"
        );
    }

    #[test]
    fn test_snapshot_request_without_state_is_only_broadcast() {
        let (relay, _) = relay(EncryptionBoundary::Server);
        let room = RoomId::new("r").unwrap();
        let (_sub, seen) = listen(&relay, &room);

        let request = plain(SyncMessage::RequestSnapshot { version: vec![] });
        assert_eq!(relay.accept(&room, request).unwrap(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
