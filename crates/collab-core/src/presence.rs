//! Presence: who is in the room and where their cursor is.
//!
//! Two [`EphemeralStore`]s keyed by the local identity string:
//! - `cursors` replicated through `cursor-update`
//! - `users` replicated through `user-update`
//!
//! Values are small JSON payloads ([`CursorState`], [`UserState`]). The owner
//! must re-assert its entries before the TTL runs out, see
//! [`refresh_interval`].

use crate::ephemeral::{self, Clock, EphemeralStore};
use crate::events::Subscription;
use crate::message::SyncMessage;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Fraction of the TTL between refreshes of the local entries.
const REFRESH_FRACTION: f64 = 0.4;
/// Maximum relative jitter applied to the refresh interval.
const REFRESH_JITTER: f64 = 0.1;

/// Display name and color shown next to a collaborator's cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserState {
    pub name: String,
    pub color: String,
}

/// Selection as text offsets. `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub anchor: u32,
    pub head: u32,
}

/// Which presence store a delta belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Cursor,
    User,
}

impl PresenceKind {
    /// Wrap a delta from this store into its wire message.
    pub fn message(self, bytes: Vec<u8>) -> SyncMessage {
        match self {
            PresenceKind::Cursor => SyncMessage::CursorUpdate { bytes },
            PresenceKind::User => SyncMessage::UserUpdate { bytes },
        }
    }
}

/// Presence state of one room, seen from one peer.
#[derive(Clone, Debug)]
pub struct Presence {
    identity: String,
    cursors: EphemeralStore,
    users: EphemeralStore,
}

impl Presence {
    pub fn new(identity: impl Into<String>, ttl: Duration) -> Self {
        Self::with_clock(identity, ttl, ephemeral::system_clock())
    }

    pub fn with_clock(identity: impl Into<String>, ttl: Duration, clock: Clock) -> Self {
        Self {
            identity: identity.into(),
            cursors: EphemeralStore::with_clock(ttl, clock.clone()),
            users: EphemeralStore::with_clock(ttl, clock),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn ttl(&self) -> Duration {
        self.users.ttl()
    }

    pub fn store(&self, kind: PresenceKind) -> &EphemeralStore {
        match kind {
            PresenceKind::Cursor => &self.cursors,
            PresenceKind::User => &self.users,
        }
    }

    pub fn set_user(&self, user: &UserState) {
        match serde_json::to_vec(user) {
            Ok(bytes) => self.users.set(&self.identity, bytes),
            Err(e) => warn!("Failed to encode user state: {}", e),
        }
    }

    pub fn set_cursor(&self, cursor: CursorState) {
        match serde_json::to_vec(&cursor) {
            Ok(bytes) => self.cursors.set(&self.identity, bytes),
            Err(e) => warn!("Failed to encode cursor state: {}", e),
        }
    }

    /// Remove the local cursor everywhere (e.g. editor lost focus).
    pub fn clear_cursor(&self) {
        self.cursors.delete(&self.identity);
    }

    /// Live users keyed by identity. Undecodable payloads are skipped.
    pub fn users(&self) -> HashMap<String, UserState> {
        decode_states(&self.users)
    }

    pub fn cursors(&self) -> HashMap<String, CursorState> {
        decode_states(&self.cursors)
    }

    /// Rewrite the local entries with a fresh timestamp so they do not expire.
    pub fn refresh_local(&self) {
        for store in [&self.users, &self.cursors] {
            if let Some(value) = store.get(&self.identity) {
                store.set(&self.identity, value);
            }
        }
    }

    /// Merge a remote presence delta. Returns the identities that changed.
    pub fn apply(&self, kind: PresenceKind, delta: &[u8]) -> ephemeral::Result<Vec<String>> {
        let changed = self.store(kind).apply(delta)?;
        if !changed.is_empty() {
            debug!("Presence {:?} changed for {:?}", kind, changed);
        }
        Ok(changed)
    }

    /// Observe local deltas of both stores, tagged with their kind.
    pub fn on_local_update(
        &self,
        callback: impl Fn(PresenceKind, &[u8]) + Send + Sync + 'static,
    ) -> [Subscription; 2] {
        let callback = std::sync::Arc::new(callback);
        let user_cb = std::sync::Arc::clone(&callback);
        [
            self.cursors
                .on_local_update(move |delta| callback(PresenceKind::Cursor, delta)),
            self.users
                .on_local_update(move |delta| user_cb(PresenceKind::User, delta)),
        ]
    }

    pub fn remove_outdated(&self) {
        self.cursors.remove_outdated();
        self.users.remove_outdated();
    }
}

fn decode_states<T: for<'de> Deserialize<'de>>(store: &EphemeralStore) -> HashMap<String, T> {
    store
        .get_all_states()
        .into_iter()
        .filter_map(|(key, bytes)| match serde_json::from_slice(&bytes) {
            Ok(value) => Some((key, value)),
            Err(e) => {
                debug!("Skipping undecodable presence entry {}: {}", key, e);
                None
            }
        })
        .collect()
}

/// How often the owner re-asserts its presence: 40% of the TTL with up to
/// ±10% random jitter, so peers opened together do not refresh in lockstep.
pub fn refresh_interval(ttl: Duration) -> Duration {
    let jitter = rand::rng().random_range(-REFRESH_JITTER..=REFRESH_JITTER);
    ttl.mul_f64(REFRESH_FRACTION * (1.0 + jitter))
}
