//! In-process push transport bound directly to a `RoomRegistry`.
//!
//! Used when client and relay share a process, and by tests that want the
//! real fan-out semantics without a network.

use crate::transport::{FrameStream, PushTransport, Result};
use async_trait::async_trait;
use collab_core::{Delivery, Frame, RoomId, RoomRegistry};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Frames buffered per subscriber before new ones are dropped.
pub const DEFAULT_BUFFER: usize = 256;

#[derive(Clone)]
pub struct LocalTransport {
    registry: RoomRegistry,
    buffer: usize,
}

impl LocalTransport {
    pub fn new(registry: RoomRegistry) -> Self {
        Self::with_buffer(registry, DEFAULT_BUFFER)
    }

    pub fn with_buffer(registry: RoomRegistry, buffer: usize) -> Self {
        Self {
            registry,
            buffer: buffer.max(1),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }
}

#[async_trait]
impl PushTransport for LocalTransport {
    async fn open(&self, room: &RoomId) -> Result<FrameStream> {
        let (tx, rx) = mpsc::channel::<Frame>(self.buffer);
        let subscription = self.registry.subscribe(room, move |frame: &Frame| {
            match tx.try_send(Frame::clone(frame)) {
                Ok(()) => Delivery::Accepted,
                Err(TrySendError::Full(_)) => Delivery::Dropped,
                Err(TrySendError::Closed(_)) => Delivery::Closed,
            }
        });

        // The stream owns the subscription: dropping it leaves the room
        let frames = futures::stream::unfold((rx, subscription), |(mut rx, subscription)| async move {
            let frame = rx.recv().await?;
            Some((Ok(frame.to_string()), (rx, subscription)))
        });
        Ok(frames.boxed())
    }

    async fn post(&self, room: &RoomId, frame: String) -> Result<()> {
        self.registry.publish(room, frame);
        Ok(())
    }
}
