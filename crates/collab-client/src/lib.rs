//! collab-client: Keeps a local document and presence in sync with a room.
//!
//! Layers, bottom-up:
//! - [`PushTransport`]: push stream + one-shot post ([`HttpTransport`] over
//!   SSE/HTTP, [`LocalTransport`] in-process)
//! - [`SyncChannel`]: sender tagging, self-filtering, frame encryption
//! - [`CollabSession`]: replication driver with flush and presence timers

pub mod channel;
pub mod config;
pub mod http;
pub mod local;
pub mod session;
pub mod transport;

pub use channel::{ChannelEvent, SyncChannel};
pub use config::{Encryption, ReconnectConfig, SessionConfig, calculate_backoff};
pub use http::{HttpTransport, SseDecoder};
pub use local::LocalTransport;
pub use session::{CollabSession, SessionError};
pub use transport::{FrameStream, PushTransport, TransportError};
