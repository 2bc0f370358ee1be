//! Room state received as `send-state` frames.
//!
//! Every stored state is merged into one document per room, so states flushed
//! by peers that never saw each other's edits still add up. Writing state to
//! disk is left to implementors of [`StateStore`].

use std::collections::HashMap;
use std::sync::RwLock;

use collab_core::{DocumentError, RoomId, SharedDocument};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StateStoreError>;

pub trait StateStore: Send + Sync {
    /// Merge a full-state export into the room's stored document.
    fn save(&self, room: &RoomId, state: &[u8]) -> Result<()>;

    /// The merged document for `room`, if anything was ever saved.
    fn load(&self, room: &RoomId) -> Result<Option<SharedDocument>>;
}

/// In-memory store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStateStore {
    rooms: RwLock<HashMap<RoomId, SharedDocument>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl StateStore for MemoryStateStore {
    fn save(&self, room: &RoomId, state: &[u8]) -> Result<()> {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let changed = match rooms.get(room) {
            Some(document) => document.import(state)?,
            None => {
                rooms.insert(room.clone(), SharedDocument::from_bytes(state)?);
                true
            }
        };
        tracing::debug!("Stored state for room {} (changed: {})", room, changed);
        Ok(())
    }

    fn load(&self, room: &RoomId) -> Result<Option<SharedDocument>> {
        Ok(self
            .rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room)
            .cloned())
    }
}
