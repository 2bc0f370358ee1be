//! EphemeralStore: TTL-expiring, last-writer-wins key-value map for presence.
//!
//! Each entry carries the timestamp of its last write. Entries older than the
//! store TTL read as absent even before `remove_outdated` purges them, so
//! expiry needs no coordination between replicas.
//!
//! Deltas are bincode-encoded lists of `(key, value, timestamp)`; a `None`
//! value is a tombstone left by `delete`.

use crate::events::{CallbackRegistry, Subscription};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{trace, warn};

#[derive(Debug, Error)]
pub enum EphemeralError {
    #[error("Ephemeral delta codec error: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, EphemeralError>;

/// Millisecond wall clock. Injectable so tests can move time by hand.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Wall clock in milliseconds since the Unix epoch.
pub fn system_clock() -> Clock {
    Arc::new(|| {
        web_time::SystemTime::now()
            .duration_since(web_time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DeltaEntry {
    key: String,
    value: Option<Vec<u8>>,
    timestamp: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Option<Vec<u8>>,
    timestamp: u64,
}

struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    ttl_ms: u64,
    clock: Clock,
    local_updates: Arc<CallbackRegistry<[u8]>>,
}

/// Replicated presence map. Clones share state.
#[derive(Clone)]
pub struct EphemeralStore {
    inner: Arc<Inner>,
}

impl EphemeralStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, system_clock())
    }

    pub fn with_clock(ttl: Duration, clock: Clock) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                ttl_ms: ttl.as_millis() as u64,
                clock,
                local_updates: Arc::new(CallbackRegistry::new()),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.inner.ttl_ms)
    }

    fn now(&self) -> u64 {
        (self.inner.clock)()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_expired(&self, timestamp: u64, now: u64) -> bool {
        now.saturating_sub(timestamp) > self.inner.ttl_ms
    }

    /// Write the local value for `key` and emit its delta.
    pub fn set(&self, key: &str, value: impl Into<Vec<u8>>) {
        self.write(key, Some(value.into()));
    }

    /// Tombstone `key` so remote replicas drop it before the TTL runs out.
    pub fn delete(&self, key: &str) {
        self.write(key, None);
    }

    fn write(&self, key: &str, value: Option<Vec<u8>>) {
        let now = self.now();
        let delta = {
            let mut entries = self.entries();
            // Successive local writes must win even within the same millisecond
            let timestamp = match entries.get(key) {
                Some(prev) if prev.timestamp >= now => prev.timestamp + 1,
                _ => now,
            };
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.clone(),
                    timestamp,
                },
            );
            encode_entries(&[DeltaEntry {
                key: key.to_string(),
                value,
                timestamp,
            }])
        };

        match delta {
            Ok(bytes) => {
                trace!("Ephemeral write {} ({} bytes delta)", key, bytes.len());
                self.inner.local_updates.emit(&bytes);
            }
            Err(e) => warn!("Failed to encode ephemeral delta for {}: {}", key, e),
        }
    }

    /// Live value for `key`, or `None` if unset, deleted or expired.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.now();
        self.entries()
            .get(key)
            .filter(|entry| !self.is_expired(entry.timestamp, now))
            .and_then(|entry| entry.value.clone())
    }

    /// Every live entry. Expired entries are absent even if not yet purged.
    pub fn get_all_states(&self) -> HashMap<String, Vec<u8>> {
        let now = self.now();
        self.entries()
            .iter()
            .filter(|(_, entry)| !self.is_expired(entry.timestamp, now))
            .filter_map(|(key, entry)| entry.value.clone().map(|v| (key.clone(), v)))
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.get_all_states().into_keys().collect()
    }

    /// Physically drop expired entries. Returns the purged keys.
    pub fn remove_outdated(&self) -> Vec<String> {
        let now = self.now();
        let mut entries = self.entries();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry.timestamp, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
        }
        expired
    }

    /// Delta carrying the current entry for `key` (empty if unknown).
    pub fn encode(&self, key: &str) -> Result<Vec<u8>> {
        let entries = self.entries();
        let list: Vec<DeltaEntry> = entries
            .get(key)
            .map(|entry| DeltaEntry {
                key: key.to_string(),
                value: entry.value.clone(),
                timestamp: entry.timestamp,
            })
            .into_iter()
            .collect();
        Ok(encode_entries(&list)?)
    }

    /// Delta carrying every unexpired entry, tombstones included.
    pub fn encode_all(&self) -> Result<Vec<u8>> {
        let now = self.now();
        let entries = self.entries();
        let list: Vec<DeltaEntry> = entries
            .iter()
            .filter(|(_, entry)| !self.is_expired(entry.timestamp, now))
            .map(|(key, entry)| DeltaEntry {
                key: key.clone(),
                value: entry.value.clone(),
                timestamp: entry.timestamp,
            })
            .collect();
        Ok(encode_entries(&list)?)
    }

    /// Merge a remote delta, last-writer-wins per key.
    ///
    /// Equal timestamps are broken by the larger value (tombstones lose), so
    /// every replica settles on the same entry. Returns the keys whose entry changed. Entries already past the TTL on
    /// the local clock are ignored.
    pub fn apply(&self, delta: &[u8]) -> Result<Vec<String>> {
        let incoming: Vec<DeltaEntry> = bincode::deserialize(delta)?;
        let now = self.now();
        let mut entries = self.entries();
        let mut changed = Vec::new();

        for item in incoming {
            if self.is_expired(item.timestamp, now) {
                continue;
            }
            if let Some(current) = entries.get(&item.key) {
                if !supersedes(&item, current) {
                    continue;
                }
            }
            changed.push(item.key.clone());
            entries.insert(
                item.key,
                Entry {
                    value: item.value,
                    timestamp: item.timestamp,
                },
            );
        }
        Ok(changed)
    }

    /// Observe deltas produced by local `set`/`delete`.
    pub fn on_local_update(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) -> Subscription {
        self.inner.local_updates.subscribe(callback)
    }
}

/// Whether `incoming` replaces `current` under last-writer-wins.
fn supersedes(incoming: &DeltaEntry, current: &Entry) -> bool {
    match incoming.timestamp.cmp(&current.timestamp) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => incoming.value > current.value,
    }
}

fn encode_entries(entries: &[DeltaEntry]) -> std::result::Result<Vec<u8>, bincode::Error> {
    bincode::serialize(entries)
}

impl std::fmt::Debug for EphemeralStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralStore")
            .field("ttl_ms", &self.inner.ttl_ms)
            .field("entries", &self.entries().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct ManualClock(Arc<AtomicU64>);

    impl ManualClock {
        fn new(start: u64) -> Self {
            Self(Arc::new(AtomicU64::new(start)))
        }

        fn clock(&self) -> Clock {
            let now = Arc::clone(&self.0);
            Arc::new(move || now.load(Ordering::SeqCst))
        }

        fn advance(&self, ms: u64) {
            self.0.fetch_add(ms, Ordering::SeqCst);
        }
    }

    const TTL: Duration = Duration::from_millis(30_000);

    #[test]
    fn test_set_visible_immediately() {
        let time = ManualClock::new(1_000);
        let store = EphemeralStore::with_clock(TTL, time.clock());

        store.set("alice", b"cursor@4".to_vec());
        assert_eq!(store.get("alice").as_deref(), Some(&b"cursor@4"[..]));
        assert_eq!(store.get_all_states().len(), 1);
    }

    #[test]
    fn test_entry_expires_without_further_writes() {
        let time = ManualClock::new(1_000);
        let store = EphemeralStore::with_clock(TTL, time.clock());
        store.set("alice", b"x".to_vec());

        time.advance(30_000);
        assert!(store.get("alice").is_some(), "exactly TTL old is still live");

        time.advance(1);
        assert!(store.get("alice").is_none());
        assert!(store.get_all_states().is_empty());

        assert_eq!(store.remove_outdated(), vec!["alice".to_string()]);
    }

    #[test]
    fn test_apply_last_writer_wins() {
        let time = ManualClock::new(1_000);
        let a = EphemeralStore::with_clock(TTL, time.clock());
        let b = EphemeralStore::with_clock(TTL, time.clock());

        a.set("k", b"old".to_vec());
        let old = a.encode("k").unwrap();
        time.advance(10);
        b.set("k", b"new".to_vec());
        let new = b.encode("k").unwrap();

        // Delivery order does not matter
        a.apply(&new).unwrap();
        a.apply(&old).unwrap();
        b.apply(&old).unwrap();

        assert_eq!(a.get("k").as_deref(), Some(&b"new"[..]));
        assert_eq!(b.get("k").as_deref(), Some(&b"new"[..]));
    }

    #[test]
    fn test_equal_timestamps_converge() {
        let time = ManualClock::new(1_000);
        let a = EphemeralStore::with_clock(TTL, time.clock());
        let b = EphemeralStore::with_clock(TTL, time.clock());

        // Same identity in two places writing in the same millisecond
        a.set("alice", b"tab-1".to_vec());
        b.set("alice", b"tab-2".to_vec());
        let from_a = a.encode("alice").unwrap();
        let from_b = b.encode("alice").unwrap();

        assert_eq!(a.apply(&from_b).unwrap(), vec!["alice".to_string()]);
        assert!(b.apply(&from_a).unwrap().is_empty());
        assert_eq!(a.get("alice"), b.get("alice"));
        assert_eq!(a.get("alice").as_deref(), Some(&b"tab-2"[..]));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let time = ManualClock::new(1_000);
        let a = EphemeralStore::with_clock(TTL, time.clock());
        let b = EphemeralStore::with_clock(TTL, time.clock());
        a.set("k", b"v".to_vec());
        let delta = a.encode_all().unwrap();

        assert_eq!(b.apply(&delta).unwrap(), vec!["k".to_string()]);
        assert!(b.apply(&delta).unwrap().is_empty());
    }

    #[test]
    fn test_apply_ignores_expired_entries() {
        let time = ManualClock::new(1_000);
        let a = EphemeralStore::with_clock(TTL, time.clock());
        a.set("stale", b"v".to_vec());
        let delta = a.encode("stale").unwrap();

        time.advance(60_000);
        let b = EphemeralStore::with_clock(TTL, time.clock());
        assert!(b.apply(&delta).unwrap().is_empty());
        assert!(b.get("stale").is_none());
    }

    #[test]
    fn test_delete_propagates_tombstone() {
        let time = ManualClock::new(1_000);
        let a = EphemeralStore::with_clock(TTL, time.clock());
        let b = EphemeralStore::with_clock(TTL, time.clock());

        a.set("k", b"v".to_vec());
        b.apply(&a.encode("k").unwrap()).unwrap();
        a.delete("k");
        b.apply(&a.encode("k").unwrap()).unwrap();

        assert!(a.get("k").is_none());
        assert!(b.get("k").is_none());
        assert!(b.get_all_states().is_empty());
    }

    #[test]
    fn test_local_writes_emit_deltas() {
        let time = ManualClock::new(1_000);
        let a = EphemeralStore::with_clock(TTL, time.clock());
        let b = EphemeralStore::with_clock(TTL, time.clock());

        let peer = b.clone();
        let _sub = a.on_local_update(move |delta| {
            peer.apply(delta).unwrap();
        });

        a.set("k", b"1".to_vec());
        a.set("k", b"2".to_vec());
        assert_eq!(b.get("k").as_deref(), Some(&b"2"[..]));
    }

    #[test]
    fn test_garbage_delta_rejected() {
        let store = EphemeralStore::new(TTL);
        assert!(store.apply(&[0xff; 3]).is_err());
    }
}
