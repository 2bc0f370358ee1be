//! CollabSession: keeps one document and its presence in sync with a room.
//!
//! While enabled, a session owns a driver task that:
//! - opens a [`SyncChannel`] and sends `request-snapshot` on every connect
//! - routes inbound messages through the [`Replicator`] and sends replies
//! - forwards local document deltas as `update` and local presence deltas as
//!   `cursor-update` / `user-update`
//! - every flush interval, sends `send-state` if the document has unflushed ops
//! - re-asserts local presence at 40% of the TTL (jittered)
//! - reopens the channel with backoff when the push stream ends
//!
//! Disabling or dropping the session aborts the driver and releases the
//! document and presence callbacks, so re-enabling never leaks handlers.

use crate::channel::{ChannelEvent, SyncChannel};
use crate::config::{SessionConfig, calculate_backoff};
use crate::transport::PushTransport;
use collab_core::{
    CodecError, FrameCodec, Presence, ReplicationState, Replicator, SenderId, SharedDocument,
    Subscription, SyncMessage, refresh_interval,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Resources that exist only while the session is enabled.
struct ActiveLink {
    driver: JoinHandle<()>,
    _document_sub: Subscription,
    _presence_subs: [Subscription; 2],
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

pub struct CollabSession {
    transport: Arc<dyn PushTransport>,
    document: SharedDocument,
    presence: Presence,
    config: SessionConfig,
    codec: FrameCodec,
    sender_id: SenderId,
    state_tx: watch::Sender<ReplicationState>,
    link: Option<ActiveLink>,
}

impl CollabSession {
    /// Create a disabled session. Call [`set_enabled`](Self::set_enabled) to connect.
    pub fn new(
        transport: Arc<dyn PushTransport>,
        document: SharedDocument,
        presence: Presence,
        config: SessionConfig,
    ) -> Result<Self> {
        let codec = config.encryption.codec(&config.room)?;
        let (state_tx, _) = watch::channel(ReplicationState::Uninitialized);
        Ok(Self {
            transport,
            document,
            presence,
            config,
            codec,
            sender_id: SenderId::generate(),
            state_tx,
            link: None,
        })
    }

    pub fn document(&self) -> &SharedDocument {
        &self.document
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn sender_id(&self) -> SenderId {
        self.sender_id
    }

    pub fn is_enabled(&self) -> bool {
        self.link.is_some()
    }

    pub fn state(&self) -> ReplicationState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ReplicationState> {
        self.state_tx.subscribe()
    }

    /// Wait until the replication state equals `target`.
    pub async fn wait_for(&self, target: ReplicationState) {
        let mut rx = self.state_tx.subscribe();
        // The sender lives in self, so this cannot fail while we are borrowed
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Connect when `enabled` becomes true, tear down when it becomes false.
    ///
    /// Must be called inside a tokio runtime.
    pub fn set_enabled(&mut self, enabled: bool) {
        match (enabled, self.link.is_some()) {
            (true, false) => {
                info!("Enabling collaboration for room {}", self.config.room);
                self.link = Some(self.start());
            }
            (false, true) => {
                info!("Disabling collaboration for room {}", self.config.room);
                self.link = None;
            }
            _ => {}
        }
    }

    /// Disable and release everything. Equivalent to dropping the session.
    pub fn close(&mut self) {
        self.set_enabled(false);
    }

    fn start(&self) -> ActiveLink {
        let (local_tx, local_rx) = mpsc::unbounded_channel();

        let document_tx = local_tx.clone();
        let document_sub = self.document.on_local_update(move |bytes| {
            let _ = document_tx.send(SyncMessage::Update {
                bytes: bytes.to_vec(),
            });
        });
        let presence_subs = self.presence.on_local_update(move |kind, bytes| {
            let _ = local_tx.send(kind.message(bytes.to_vec()));
        });

        let driver = Driver {
            transport: Arc::clone(&self.transport),
            replicator: Replicator::new(self.document.clone(), self.presence.clone()),
            config: self.config.clone(),
            codec: self.codec.clone(),
            sender_id: self.sender_id,
            state_tx: self.state_tx.clone(),
            local_rx,
        };

        ActiveLink {
            driver: tokio::spawn(driver.run()),
            _document_sub: document_sub,
            _presence_subs: presence_subs,
        }
    }
}

/// State owned by the driver task.
struct Driver {
    transport: Arc<dyn PushTransport>,
    replicator: Replicator,
    config: SessionConfig,
    codec: FrameCodec,
    sender_id: SenderId,
    state_tx: watch::Sender<ReplicationState>,
    local_rx: mpsc::UnboundedReceiver<SyncMessage>,
}

impl Driver {
    async fn run(mut self) {
        let room = self.config.room.clone();
        let ttl = self.presence_ttl();

        let mut flush = tokio::time::interval_at(
            Instant::now() + self.config.flush_interval,
            self.config.flush_interval,
        );
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let refresh = tokio::time::sleep(refresh_interval(ttl));
        tokio::pin!(refresh);

        let mut attempt: u32 = 0;
        loop {
            let (channel, mut events) = SyncChannel::open(
                Arc::clone(&self.transport),
                room.clone(),
                self.codec.clone(),
                self.sender_id,
            );

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(ChannelEvent::Connected) => {
                            attempt = 0;
                            channel.send(self.replicator.on_connect());
                            self.publish_state();
                            // Announce ourselves right away instead of waiting for the refresh
                            self.replicator.presence().refresh_local();
                        }
                        Some(ChannelEvent::Message { sender, message }) => {
                            let kind = message.kind();
                            match self.replicator.handle(message) {
                                Ok(Some(reply)) => channel.send(reply),
                                Ok(None) => {}
                                Err(e) => warn!("Failed to apply {} from {}: {}", kind, sender, e),
                            }
                            self.publish_state();
                        }
                        Some(ChannelEvent::Disconnected) | None => break,
                    },
                    Some(message) = self.local_rx.recv() => channel.send(message),
                    _ = flush.tick() => match self.replicator.flush_state() {
                        Ok(Some(state)) => {
                            debug!("Flushing document state for room {}", room);
                            channel.send(state);
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Failed to export state for room {}: {}", room, e),
                    },
                    _ = &mut refresh => {
                        let presence = self.replicator.presence();
                        presence.refresh_local();
                        presence.remove_outdated();
                        refresh.as_mut().reset(Instant::now() + refresh_interval(ttl));
                    }
                }
            }

            drop(channel);
            attempt = attempt.saturating_add(1);
            let delay = calculate_backoff(attempt, &self.config.reconnect);
            warn!(
                "Channel for room {} disconnected, reconnecting in {:?} (attempt {})",
                room, delay, attempt
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn presence_ttl(&self) -> std::time::Duration {
        self.replicator.presence().ttl()
    }

    fn publish_state(&self) {
        let state = self.replicator.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Room {} replication state: {:?}", self.config.room, state);
            *current = state;
            true
        });
    }
}
