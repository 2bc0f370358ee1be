//! collab-core: Shared library for room-based real-time collaboration using Loro CRDTs.
//!
//! This crate provides the runtime-agnostic pieces of the sync layer:
//! - Room identifiers and the in-memory room registry (broadcast fan-out)
//! - The wire envelope and frame codec (room-key encryption)
//! - A Loro document wrapper with explicit callback registration
//! - The TTL-based ephemeral store used for presence
//! - The replication state machine that reconciles snapshots and deltas
//!
//! Networking lives in `collab-client` (push transports, sessions) and
//! `collab-server` (HTTP relay).

pub mod codec;
pub mod document;
pub mod ephemeral;
pub mod events;
pub mod message;
pub mod presence;
pub mod registry;
pub mod replication;
pub mod room;
pub mod sender;

pub use codec::{CodecError, FrameCodec, RoomCipher};
pub use document::{DocumentError, SharedDocument};
pub use ephemeral::{Clock, EphemeralError, EphemeralStore, system_clock};
pub use events::{CallbackRegistry, Subscription};
pub use message::{Envelope, SyncMessage};
pub use presence::{CursorState, Presence, PresenceKind, UserState, refresh_interval};
pub use registry::{Delivery, Frame, RegistryStats, RoomRegistry, RoomSubscription};
pub use replication::{ReplicationError, ReplicationState, Replicator};
pub use room::{RoomId, RoomIdError};
pub use sender::{SenderId, SenderIdError};
