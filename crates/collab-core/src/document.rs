//! SharedDocument: Loro document wrapper used as the replicated source of truth.
//!
//! The replication protocol only reaches the CRDT through this type:
//! - `export_snapshot` / `export_updates` produce byte payloads
//! - `import` merges remote payloads (idempotent, order-independent)
//! - `on_local_update` / `on_import` notify observers with the raw delta
//!
//! The wrapper also keeps a dirty flag: a local commit marks the document as
//! having unflushed ops, and
//! [`SharedDocument::take_flush_snapshot`] hands out a snapshot only then.

use crate::events::{CallbackRegistry, Subscription};
use loro::{ExportMode, LoroDoc, LoroText, VersionVector};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Export error: {0}")]
    Export(String),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

struct DocInner {
    doc: LoroDoc,
    local_updates: Arc<CallbackRegistry<[u8]>>,
    imports: Arc<CallbackRegistry<[u8]>>,
    dirty: Arc<AtomicBool>,
}

/// Cheaply cloneable handle to one replicated Loro document.
#[derive(Clone)]
pub struct SharedDocument {
    inner: Arc<DocInner>,
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedDocument {
    /// Create an empty document with a random peer id.
    pub fn new() -> Self {
        Self::from_doc(LoroDoc::new())
    }

    /// Create an empty document with a fixed Loro peer id.
    pub fn with_peer_id(peer: u64) -> Result<Self> {
        let doc = LoroDoc::new();
        doc.set_peer_id(peer)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        Ok(Self::from_doc(doc))
    }

    /// Load a document from snapshot or update bytes.
    ///
    /// The loaded state counts as flushed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let document = Self::new();
        document
            .inner
            .doc
            .import(bytes)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        Ok(document)
    }

    fn from_doc(doc: LoroDoc) -> Self {
        let local_updates: Arc<CallbackRegistry<[u8]>> = Arc::new(CallbackRegistry::new());
        let imports: Arc<CallbackRegistry<[u8]>> = Arc::new(CallbackRegistry::new());
        let dirty = Arc::new(AtomicBool::new(false));

        let registry = Arc::clone(&local_updates);
        let flag = Arc::clone(&dirty);
        doc.subscribe_local_update(Box::new(move |bytes| {
            flag.store(true, Ordering::Release);
            trace!("Local update: {} bytes", bytes.len());
            registry.emit(bytes.as_slice());
            true
        }))
        .detach();

        Self {
            inner: Arc::new(DocInner {
                doc,
                local_updates,
                imports,
                dirty,
            }),
        }
    }

    /// Access the underlying Loro document.
    pub fn loro(&self) -> &LoroDoc {
        &self.inner.doc
    }

    pub fn text(&self, name: &str) -> LoroText {
        self.inner.doc.get_text(name)
    }

    /// Insert into a text container and commit, emitting a local update.
    pub fn insert_text(&self, name: &str, pos: usize, value: &str) -> Result<()> {
        self.text(name)
            .insert(pos, value)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.commit();
        Ok(())
    }

    /// Delete from a text container and commit.
    pub fn delete_text(&self, name: &str, pos: usize, len: usize) -> Result<()> {
        self.text(name)
            .delete(pos, len)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.commit();
        Ok(())
    }

    pub fn text_content(&self, name: &str) -> String {
        self.text(name).to_string()
    }

    /// Commit pending local operations. Triggers `on_local_update` callbacks.
    pub fn commit(&self) {
        self.inner.doc.commit();
    }

    /// Version vector of the oplog (everything this replica has seen).
    pub fn oplog_version(&self) -> VersionVector {
        self.inner.doc.oplog_vv()
    }

    /// Oplog version in its wire encoding, as carried by `request-snapshot`.
    pub fn encoded_version(&self) -> Vec<u8> {
        self.oplog_version().encode()
    }

    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.inner
            .doc
            .export(ExportMode::Snapshot)
            .map_err(|e| DocumentError::Export(e.to_string()))
    }

    /// Export every update not covered by `from`.
    pub fn export_updates(&self, from: &VersionVector) -> Result<Vec<u8>> {
        self.inner
            .doc
            .export(ExportMode::updates(from))
            .map_err(|e| DocumentError::Export(e.to_string()))
    }

    /// Export updates since an encoded version.
    ///
    /// An empty or undecodable version exports everything, so the requester
    /// always gets at least the range it is missing.
    pub fn export_updates_from_encoded(&self, version: &[u8]) -> Result<Vec<u8>> {
        let from = if version.is_empty() {
            VersionVector::default()
        } else {
            match VersionVector::decode(version) {
                Ok(vv) => vv,
                Err(e) => {
                    debug!("Undecodable version ({}), exporting all updates", e);
                    VersionVector::default()
                }
            }
        };
        self.export_updates(&from)
    }

    /// Merge remote bytes. Returns whether the oplog advanced.
    ///
    /// Importing already-known data is a no-op and returns `false`.
    pub fn import(&self, bytes: &[u8]) -> Result<bool> {
        let before = self.inner.doc.oplog_vv();
        self.inner
            .doc
            .import(bytes)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        let changed = self.inner.doc.oplog_vv() != before;

        // Remote ops stay clean: their author flushes them
        if changed {
            self.inner.imports.emit(bytes);
        }
        trace!("Imported {} bytes (changed: {})", bytes.len(), changed);
        Ok(changed)
    }

    /// Observe deltas produced by local commits.
    pub fn on_local_update(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) -> Subscription {
        self.inner.local_updates.subscribe(callback)
    }

    /// Observe remote payloads that changed this replica.
    pub fn on_import(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) -> Subscription {
        self.inner.imports.subscribe(callback)
    }

    /// Whether there are ops not yet handed out by `take_flush_snapshot`.
    pub fn has_unflushed_ops(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    /// Snapshot for durable storage, only if something changed since the last flush.
    pub fn take_flush_snapshot(&self) -> Result<Option<Vec<u8>>> {
        if !self.inner.dirty.swap(false, Ordering::AcqRel) {
            return Ok(None);
        }
        match self.export_snapshot() {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                // Keep the ops pending so the next tick retries
                self.inner.dirty.store(true, Ordering::Release);
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDocument")
            .field("peer_id", &self.inner.doc.peer_id())
            .field("dirty", &self.has_unflushed_ops())
            .finish()
    }
}
