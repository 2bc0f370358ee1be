//! Room registry: fan-out of raw frames to the subscribers of a room.
//!
//! Rooms exist only while they have subscribers. `subscribe` creates a room
//! lazily, dropping the last [`RoomSubscription`] removes it. Publishing keeps
//! no backlog: a peer that is not subscribed at publish time never sees the
//! frame, and catch-up is left to the replication protocol.
//!
//! Sinks are plain callbacks invoked outside the registry lock. A sink must
//! not block; it reports [`Delivery::Dropped`] when its buffer is full, which
//! the registry counts and logs without retrying.

use crate::room::RoomId;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, trace, warn};

/// One raw message as published to a room. Cheap to clone.
pub type Frame = Arc<str>;

/// Outcome of handing a frame to a subscriber sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// Subscriber buffer full; the frame is lost for this subscriber.
    Dropped,
    /// Subscriber is gone; it will be deregistered.
    Closed,
}

type Sink = Arc<dyn Fn(&Frame) -> Delivery + Send + Sync>;

/// Counters snapshot, see [`RoomRegistry::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub rooms: usize,
    pub subscribers: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Default)]
struct Inner {
    rooms: Mutex<HashMap<RoomId, Vec<(u64, Sink)>>>,
    next_id: AtomicU64,
    counters: Counters,
}

impl Inner {
    fn remove(&self, room: &RoomId, id: u64) -> bool {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sinks) = rooms.get_mut(room) else {
            return false;
        };
        let before = sinks.len();
        sinks.retain(|(i, _)| *i != id);
        let removed = sinks.len() != before;
        if sinks.is_empty() {
            rooms.remove(room);
            debug!("Room {} has no subscribers left, removed", room);
        }
        removed
    }
}

/// Process-wide map from room id to the sinks subscribed to it.
///
/// Construct one at startup and hand clones to request handlers.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<Inner>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sink` for frames published to `room`.
    pub fn subscribe(
        &self,
        room: &RoomId,
        sink: impl Fn(&Frame) -> Delivery + Send + Sync + 'static,
    ) -> RoomSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut rooms = self.inner.rooms.lock().unwrap_or_else(|e| e.into_inner());
        let sinks = rooms.entry(room.clone()).or_insert_with(|| {
            debug!("Creating room {}", room);
            Vec::new()
        });
        sinks.push((id, Arc::new(sink)));
        trace!("Subscriber {} joined room {} ({} total)", id, room, sinks.len());

        RoomSubscription {
            registry: Arc::downgrade(&self.inner),
            room: room.clone(),
            id,
            active: true,
        }
    }

    /// Deliver `frame` to every current subscriber of `room`.
    ///
    /// Returns how many sinks accepted it. Zero subscribers is a no-op.
    pub fn publish(&self, room: &RoomId, frame: impl Into<Frame>) -> usize {
        let frame = frame.into();
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);

        let sinks: Vec<(u64, Sink)> = {
            let rooms = self.inner.rooms.lock().unwrap_or_else(|e| e.into_inner());
            match rooms.get(room) {
                Some(sinks) => sinks.iter().map(|(id, s)| (*id, Arc::clone(s))).collect(),
                None => {
                    trace!("Publish to empty room {} ignored", room);
                    return 0;
                }
            }
        };

        let mut accepted = 0;
        let mut closed = Vec::new();
        for (id, sink) in sinks {
            match sink(&frame) {
                Delivery::Accepted => accepted += 1,
                Delivery::Dropped => {
                    self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("Subscriber {} in room {} is lagging, frame dropped", id, room);
                }
                Delivery::Closed => closed.push(id),
            }
        }

        for id in closed {
            debug!("Subscriber {} in room {} closed, removing", id, room);
            self.inner.remove(room, id);
        }

        self.inner
            .counters
            .delivered
            .fetch_add(accepted as u64, Ordering::Relaxed);
        accepted
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn subscriber_count(&self, room: &RoomId) -> usize {
        self.inner
            .rooms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(room)
            .map_or(0, Vec::len)
    }

    pub fn stats(&self) -> RegistryStats {
        let (rooms, subscribers) = {
            let guard = self.inner.rooms.lock().unwrap_or_else(|e| e.into_inner());
            (guard.len(), guard.values().map(Vec::len).sum())
        };
        let counters = &self.inner.counters;
        RegistryStats {
            published: counters.published.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            rooms,
            subscribers,
        }
    }
}

/// Handle for one registered sink. Dropping it unsubscribes.
#[must_use = "dropping a RoomSubscription unsubscribes immediately"]
pub struct RoomSubscription {
    registry: Weak<Inner>,
    room: RoomId,
    id: u64,
    active: bool,
}

impl RoomSubscription {
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Deregister the sink. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(inner) = self.registry.upgrade() {
            if inner.remove(&self.room, self.id) {
                trace!("Subscriber {} left room {}", self.id, self.room);
            }
        }
    }
}

impl Drop for RoomSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for RoomSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSubscription")
            .field("room", &self.room)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn collector() -> (Arc<Mutex<Vec<String>>>, impl Fn(&Frame) -> Delivery + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sink = move |frame: &Frame| {
            seen_clone.lock().unwrap().push(frame.to_string());
            Delivery::Accepted
        };
        (seen, sink)
    }

    fn room(name: &str) -> RoomId {
        RoomId::new(name).unwrap()
    }

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let registry = RoomRegistry::new();
        let (a, sink_a) = collector();
        let (b, sink_b) = collector();
        let _sa = registry.subscribe(&room("r"), sink_a);
        let _sb = registry.subscribe(&room("r"), sink_b);

        assert_eq!(registry.publish(&room("r"), "hello"), 2);
        assert_eq!(*a.lock().unwrap(), vec!["hello"]);
        assert_eq!(*b.lock().unwrap(), vec!["hello"]);
    }

    #[test]
    fn test_rooms_are_isolated() {
        let registry = RoomRegistry::new();
        let (a, sink_a) = collector();
        let _sa = registry.subscribe(&room("a"), sink_a);

        assert_eq!(registry.publish(&room("b"), "nope"), 0);
        assert!(a.lock().unwrap().is_empty());
    }

    #[test]
    fn test_publish_to_empty_room_is_noop() {
        let registry = RoomRegistry::new();
        assert_eq!(registry.publish(&room("ghost"), "x"), 0);
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_room_gc_and_no_backlog() {
        let registry = RoomRegistry::new();
        let (_, sink) = collector();
        let sub = registry.subscribe(&room("r"), sink);
        assert_eq!(registry.room_count(), 1);

        drop(sub);
        assert_eq!(registry.room_count(), 0);

        // Published while nobody listens: must not be replayed later
        assert_eq!(registry.publish(&room("r"), "missed"), 0);

        let (late, sink) = collector();
        let _sub = registry.subscribe(&room("r"), sink);
        registry.publish(&room("r"), "fresh");
        assert_eq!(*late.lock().unwrap(), vec!["fresh"]);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let registry = RoomRegistry::new();
        let (_, sink_a) = collector();
        let (_, sink_b) = collector();
        let mut sa = registry.subscribe(&room("r"), sink_a);
        let _sb = registry.subscribe(&room("r"), sink_b);

        sa.unsubscribe();
        sa.unsubscribe();
        drop(sa);
        assert_eq!(registry.subscriber_count(&room("r")), 1);
    }

    #[test]
    fn test_dropped_delivery_is_counted() {
        let registry = RoomRegistry::new();
        let _slow = registry.subscribe(&room("r"), |_: &Frame| Delivery::Dropped);
        let (_, sink) = collector();
        let _fast = registry.subscribe(&room("r"), sink);

        assert_eq!(registry.publish(&room("r"), "x"), 1);
        let stats = registry.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.subscribers, 2);
    }

    #[test]
    fn test_closed_sink_is_removed() {
        let registry = RoomRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let _sub = registry.subscribe(&room("r"), move |_: &Frame| {
            calls_clone.fetch_add(1, Ordering::Relaxed);
            Delivery::Closed
        });

        registry.publish(&room("r"), "a");
        registry.publish(&room("r"), "b");
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_sink_may_publish_reentrantly() {
        let registry = RoomRegistry::new();
        let (echo, sink) = collector();
        let _listener = registry.subscribe(&room("echo"), sink);

        let inner = registry.clone();
        let _relay = registry.subscribe(&room("in"), move |frame: &Frame| {
            inner.publish(&RoomId::new("echo").unwrap(), Arc::clone(frame));
            Delivery::Accepted
        });

        registry.publish(&room("in"), "ping");
        assert_eq!(*echo.lock().unwrap(), vec!["ping"]);
    }

    #[test]
    fn test_subscription_outlives_registry() {
        let registry = RoomRegistry::new();
        let (_, sink) = collector();
        let sub = registry.subscribe(&room("r"), sink);
        drop(registry);
        drop(sub);
    }
}
