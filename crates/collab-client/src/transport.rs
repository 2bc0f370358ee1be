//! PushTransport trait: the wire underneath a sync channel.
//!
//! A push transport offers a long-lived receive stream per room and a
//! one-shot send. Implementations:
//! - [`HttpTransport`](crate::HttpTransport): SSE stream + HTTP POST
//! - [`LocalTransport`](crate::LocalTransport): in-process `RoomRegistry`

use async_trait::async_trait;
use collab_core::RoomId;
use futures::stream::BoxStream;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Unexpected status: {0}")]
    Status(u16),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Frames pushed by the server for one room, in arrival order.
pub type FrameStream = BoxStream<'static, Result<String>>;

/// Duplex transport split into a push stream and one-shot posts.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Open the receive stream for `room`. Dropping the stream unsubscribes.
    async fn open(&self, room: &RoomId) -> Result<FrameStream>;

    /// Publish one frame to every subscriber of `room`.
    async fn post(&self, room: &RoomId, frame: String) -> Result<()>;
}
