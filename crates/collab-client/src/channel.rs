//! SyncChannel: one room's logical duplex connection.
//!
//! Wraps a push transport into send + event stream:
//! - a read task opens the push stream, reports `Connected`, then decodes
//!   each frame, drops the ones carrying our own sender id and forwards the
//!   rest as `Message` events
//! - a write task encodes (and seals) outgoing messages and posts them in
//!   order; failures are logged and never retried
//!
//! Closing or dropping the channel aborts both tasks, which drops the push
//! stream and with it the room subscription.

use crate::transport::PushTransport;
use collab_core::{Envelope, FrameCodec, RoomId, SenderId, SyncMessage};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Event emitted by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Push stream is open; time to request a snapshot.
    Connected,
    /// Message from another session in the room.
    Message {
        sender: SenderId,
        message: SyncMessage,
    },
    /// Push stream ended or could not be opened.
    Disconnected,
}

pub struct SyncChannel {
    room: RoomId,
    sender_id: SenderId,
    outgoing: mpsc::UnboundedSender<SyncMessage>,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
}

impl SyncChannel {
    /// Open a channel for `room`. Must be called inside a tokio runtime.
    pub fn open(
        transport: Arc<dyn PushTransport>,
        room: RoomId,
        codec: FrameCodec,
        sender_id: SenderId,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let read_task = tokio::spawn(Self::read_loop(
            Arc::clone(&transport),
            room.clone(),
            codec.clone(),
            sender_id,
            event_tx,
        ));
        let write_task = tokio::spawn(Self::write_loop(
            transport,
            room.clone(),
            codec,
            sender_id,
            outgoing_rx,
        ));

        let channel = Self {
            room,
            sender_id,
            outgoing,
            read_task: Some(read_task),
            write_task: Some(write_task),
        };
        (channel, event_rx)
    }

    async fn read_loop(
        transport: Arc<dyn PushTransport>,
        room: RoomId,
        codec: FrameCodec,
        sender_id: SenderId,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) {
        let mut stream = match transport.open(&room).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to open push stream for room {}: {}", room, e);
                let _ = events.send(ChannelEvent::Disconnected);
                return;
            }
        };
        debug!("Channel for room {} connected", room);
        if events.send(ChannelEvent::Connected).is_err() {
            return;
        }

        while let Some(item) = stream.next().await {
            let frame = match item {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Push stream for room {} failed: {}", room, e);
                    break;
                }
            };

            let envelope = match codec.decode(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!("Discarding undecodable frame in room {}: {}", room, e);
                    continue;
                }
            };

            if envelope.sender_id == sender_id {
                trace!("Dropping own {} echo", envelope.message.kind());
                continue;
            }

            let event = ChannelEvent::Message {
                sender: envelope.sender_id,
                message: envelope.message,
            };
            if events.send(event).is_err() {
                // Nobody is listening anymore
                return;
            }
        }

        debug!("Push stream for room {} ended", room);
        let _ = events.send(ChannelEvent::Disconnected);
    }

    async fn write_loop(
        transport: Arc<dyn PushTransport>,
        room: RoomId,
        codec: FrameCodec,
        sender_id: SenderId,
        mut outgoing: mpsc::UnboundedReceiver<SyncMessage>,
    ) {
        while let Some(message) = outgoing.recv().await {
            let kind = message.kind();
            let frame = match codec.encode(&Envelope::new(sender_id, message)) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Failed to encode {} for room {}: {}", kind, room, e);
                    continue;
                }
            };
            trace!("Sending {} ({} bytes) to room {}", kind, frame.len(), room);
            if let Err(e) = transport.post(&room, frame).await {
                warn!("Failed to send {} to room {}: {}", kind, room, e);
            }
        }
    }

    /// Queue a message for sending. Never blocks; errors are only logged.
    pub fn send(&self, message: SyncMessage) {
        if let Err(e) = self.outgoing.send(message) {
            debug!(
                "Channel for room {} closed, dropping {}",
                self.room,
                e.0.kind()
            );
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn sender_id(&self) -> SenderId {
        self.sender_id
    }

    /// Stop both tasks and close the push stream.
    pub fn close(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        if let Some(task) = self.write_task.take() {
            task.abort();
        }
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalTransport;
    use collab_core::RoomRegistry;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("Timed out waiting for channel event")
            .expect("Event channel closed")
    }

    fn open(
        transport: &Arc<dyn PushTransport>,
        room: &RoomId,
        sender: SenderId,
    ) -> (SyncChannel, mpsc::UnboundedReceiver<ChannelEvent>) {
        SyncChannel::open(
            Arc::clone(transport),
            room.clone(),
            FrameCodec::sealed(room).unwrap(),
            sender,
        )
    }

    #[tokio::test]
    async fn test_message_reaches_other_channel_but_not_self() {
        let transport: Arc<dyn PushTransport> = Arc::new(LocalTransport::new(RoomRegistry::new()));
        let room = RoomId::derive("pads/channel");

        let (a, mut a_events) = open(&transport, &room, SenderId::from(1));
        let (_b, mut b_events) = open(&transport, &room, SenderId::from(2));
        assert_eq!(next_event(&mut a_events).await, ChannelEvent::Connected);
        assert_eq!(next_event(&mut b_events).await, ChannelEvent::Connected);

        let update = SyncMessage::Update { bytes: vec![1, 2] };
        a.send(update.clone());

        assert_eq!(
            next_event(&mut b_events).await,
            ChannelEvent::Message {
                sender: SenderId::from(1),
                message: update,
            }
        );
        assert!(
            timeout(Duration::from_millis(100), a_events.recv())
                .await
                .is_err(),
            "own message must not be delivered"
        );
    }

    #[tokio::test]
    async fn test_undecodable_frames_are_skipped() {
        let registry = RoomRegistry::new();
        let transport: Arc<dyn PushTransport> = Arc::new(LocalTransport::new(registry.clone()));
        let room = RoomId::derive("pads/noise");

        let (_b, mut b_events) = open(&transport, &room, SenderId::from(2));
        assert_eq!(next_event(&mut b_events).await, ChannelEvent::Connected);

        registry.publish(&room, "garbage");
        let (a, _a_events) = open(&transport, &room, SenderId::from(1));
        a.send(SyncMessage::UserUpdate { bytes: vec![9] });

        match next_event(&mut b_events).await {
            ChannelEvent::Message { message, .. } => {
                assert_eq!(message, SyncMessage::UserUpdate { bytes: vec![9] })
            }
            other => panic!("Unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_other_room_key_is_discarded() {
        let registry = RoomRegistry::new();
        let transport: Arc<dyn PushTransport> = Arc::new(LocalTransport::new(registry.clone()));
        let room = RoomId::new("shared").unwrap();

        let (_b, mut b_events) = open(&transport, &room, SenderId::from(2));
        assert_eq!(next_event(&mut b_events).await, ChannelEvent::Connected);

        // Same relay room, different key material
        let (a, _a_events) = SyncChannel::open(
            Arc::clone(&transport),
            room.clone(),
            FrameCodec::sealed(&RoomId::new("other").unwrap()).unwrap(),
            SenderId::from(1),
        );
        a.send(SyncMessage::Update { bytes: vec![1] });

        assert!(
            timeout(Duration::from_millis(100), b_events.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_close_unsubscribes() {
        let registry = RoomRegistry::new();
        let transport: Arc<dyn PushTransport> = Arc::new(LocalTransport::new(registry.clone()));
        let room = RoomId::derive("pads/close");

        let (mut channel, mut events) = open(&transport, &room, SenderId::from(1));
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);
        assert_eq!(registry.subscriber_count(&room), 1);

        channel.close();
        timeout(Duration::from_secs(2), async {
            while registry.room_count() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("room should be released after close");
    }
}
