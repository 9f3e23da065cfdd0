//! Resident document registry.
//!
//! At most one in-memory [`Document`] exists per document id. Concurrent
//! `acquire` calls for a document that is not yet resident share a single
//! load; everyone else waits for it, bounded by the configured load timeout.
//!
//! Entries are reference counted by [`DocumentHandle`]. When the last handle
//! is released the entry stays resident for a grace period, then is flushed
//! and evicted if nobody re-acquired it in the meantime. A document with
//! unsaved changes is never evicted; a failed final flush is retried after
//! another grace period. Neither is a document holding buffered operations,
//! since snapshots only carry applied ones.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::config::RegistryConfig;
use crate::crdt::{ApplyReport, Document, SERVER_REPLICA, StateVector, Update};
use crate::error::{PersistenceError, RegistryError};
use crate::ids::DocumentId;
use crate::persistence::PersistencePipeline;

type Slot = Arc<OnceCell<Arc<DocumentEntry>>>;

/// A resident document and its bookkeeping.
pub struct DocumentEntry {
    id: DocumentId,
    pub(crate) document: Mutex<Document>,
    /// Live handles; only changed while holding the registry's slot lock
    refs: AtomicUsize,
    /// Bumped on every acquire, so a pending eviction can tell it is stale
    generation: AtomicU64,
    flushed_version: AtomicUsize,
    pub(crate) flush_scheduled: AtomicBool,
    /// Serializes flushes of this entry
    pub(crate) flush_lock: tokio::sync::Mutex<()>,
}

impl DocumentEntry {
    /// `document` is considered saved as it is.
    pub(crate) fn new(id: DocumentId, document: Document) -> Self {
        let flushed_version = document.version();
        Self {
            id,
            document: Mutex::new(document),
            refs: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            flushed_version: AtomicUsize::new(flushed_version),
            flush_scheduled: AtomicBool::new(false),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub(crate) fn flushed_version(&self) -> usize {
        self.flushed_version.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_flushed(&self, version: usize) {
        self.flushed_version.fetch_max(version, Ordering::SeqCst);
    }

    /// True if every applied operation is in the last written snapshot.
    pub fn is_clean(&self) -> bool {
        self.document.lock().version() <= self.flushed_version()
    }
}

/// Shared access to a resident document.
///
/// Dropping the handle releases it.
pub struct DocumentHandle {
    entry: Arc<DocumentEntry>,
    registry: Arc<DocumentRegistry>,
}

impl DocumentHandle {
    pub fn document_id(&self) -> &DocumentId {
        self.entry.id()
    }

    /// Runs `f` with the document locked.
    pub fn read<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(&self.entry.document.lock())
    }

    pub fn apply_update(&self, update: &Update) -> ApplyReport {
        self.entry.document.lock().apply_update(update)
    }

    pub fn state_vector(&self) -> StateVector {
        self.read(Document::current_state_vector)
    }

    pub fn diff_since(&self, peer: &StateVector) -> Update {
        self.read(|document| document.diff_since(peer))
    }

    pub fn content(&self) -> String {
        self.read(|document| document.to_string())
    }

    pub fn version(&self) -> usize {
        self.read(Document::version)
    }
}

impl Drop for DocumentHandle {
    fn drop(&mut self) {
        self.registry.release_entry(&self.entry);
    }
}

impl std::fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("document_id", self.entry.id())
            .finish()
    }
}

/// Result of an eviction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    Evicted,
    /// Re-acquired, or acquired and released again, since the attempt was scheduled
    InUse,
    /// Final flush failed; the document stays resident
    FlushFailed,
    /// Buffered operations are not part of a snapshot; the document stays
    /// resident until their dependencies arrive
    AwaitingDependencies,
    NotResident,
}

pub struct DocumentRegistry {
    slots: Mutex<HashMap<DocumentId, Slot>>,
    persistence: Arc<PersistencePipeline>,
    config: RegistryConfig,
}

impl DocumentRegistry {
    pub fn new(persistence: Arc<PersistencePipeline>, config: RegistryConfig) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            persistence,
            config,
        }
    }

    /// Returns a handle to the resident document, loading it from storage
    /// first if needed.
    pub async fn acquire(
        self: &Arc<Self>,
        document_id: &DocumentId,
    ) -> Result<DocumentHandle, RegistryError> {
        loop {
            let slot = Arc::clone(
                self.slots
                    .lock()
                    .entry(document_id.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            );

            let init = slot.get_or_try_init(|| self.load(document_id));
            let entry = match tokio::time::timeout(self.config.load_timeout(), init).await {
                Ok(Ok(entry)) => Arc::clone(entry),
                Ok(Err(e)) => {
                    self.discard_empty_slot(document_id, &slot);
                    return Err(e);
                }
                Err(_) => {
                    warn!("Timed out waiting for {document_id} to load");
                    return Err(RegistryError::RaceTimeout {
                        document_id: document_id.clone(),
                        timeout: self.config.load_timeout(),
                    });
                }
            };

            let slots = self.slots.lock();
            match slots.get(document_id) {
                Some(current) if Arc::ptr_eq(current, &slot) => {
                    entry.refs.fetch_add(1, Ordering::SeqCst);
                    entry.generation.fetch_add(1, Ordering::SeqCst);
                    return Ok(DocumentHandle {
                        entry,
                        registry: Arc::clone(self),
                    });
                }
                // Evicted while we waited; start over with a fresh slot
                _ => continue,
            }
        }
    }

    /// Releases a handle. Equivalent to dropping it.
    pub fn release(&self, handle: DocumentHandle) {
        drop(handle);
    }

    fn release_entry(self: &Arc<Self>, entry: &Arc<DocumentEntry>) {
        let (remaining, generation) = {
            let _slots = self.slots.lock();
            let remaining = entry.refs.fetch_sub(1, Ordering::SeqCst) - 1;
            (remaining, entry.generation.load(Ordering::SeqCst))
        };
        if remaining > 0 {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "Released {} outside a runtime; it stays resident",
                entry.id()
            );
            return;
        };
        let registry = Arc::clone(self);
        let document_id = entry.id().clone();
        runtime.spawn(async move {
            registry.evict_after_grace(document_id, generation).await;
        });
    }

    async fn evict_after_grace(self: Arc<Self>, document_id: DocumentId, generation: u64) {
        loop {
            tokio::time::sleep(self.config.eviction_grace()).await;
            match self.try_evict(&document_id, Some(generation)).await {
                Eviction::FlushFailed => continue,
                _ => return,
            }
        }
    }

    /// Evicts `document_id` now if no handle is held.
    pub async fn evict_idle(&self, document_id: &DocumentId) -> Eviction {
        self.try_evict(document_id, None).await
    }

    async fn try_evict(&self, document_id: &DocumentId, generation: Option<u64>) -> Eviction {
        let Some(entry) = self.resident_entry(document_id) else {
            return Eviction::NotResident;
        };
        let idle = |entry: &DocumentEntry| {
            entry.refs.load(Ordering::SeqCst) == 0
                && generation.is_none_or(|g| entry.generation.load(Ordering::SeqCst) == g)
        };
        if !idle(&entry) {
            return Eviction::InUse;
        }
        let pending = entry.document.lock().pending_len();
        if pending > 0 {
            warn!(
                "Keeping {document_id} resident, {pending} operations wait for missing dependencies"
            );
            return Eviction::AwaitingDependencies;
        }

        if let Err(e) = self.persistence.flush_on_evict(&entry).await {
            error!("Keeping {document_id} resident, final flush failed: {e}");
            return Eviction::FlushFailed;
        }

        let mut slots = self.slots.lock();
        if !idle(&entry) || !entry.is_clean() || entry.document.lock().pending_len() > 0 {
            return Eviction::InUse;
        }
        slots.remove(document_id);
        self.persistence.untrack(&entry);
        drop(slots);

        info!("Evicted document {document_id}");
        Eviction::Evicted
    }

    async fn load(&self, document_id: &DocumentId) -> Result<Arc<DocumentEntry>, RegistryError> {
        let document = match self.persistence.store().load_snapshot(document_id).await {
            Ok(Some(snapshot)) => match snapshot.restore(document_id) {
                Ok(document) => document,
                Err(e) => Self::start_empty_after(e),
            },
            Ok(None) => {
                debug!("No snapshot for {document_id}, starting empty");
                Document::new(SERVER_REPLICA)
            }
            Err(e @ PersistenceError::Corrupt { .. }) => Self::start_empty_after(e),
            Err(source) => {
                error!("Failed to load {document_id}: {source}");
                return Err(RegistryError::Load {
                    document_id: document_id.clone(),
                    source,
                });
            }
        };

        info!(
            "Loaded document {} ({} operations, {} characters)",
            document_id,
            document.version(),
            document.len()
        );
        let entry = Arc::new(DocumentEntry::new(document_id.clone(), document));
        self.persistence.track(&entry);
        Ok(entry)
    }

    fn start_empty_after(error: PersistenceError) -> Document {
        error!("{error}; starting from an empty document");
        Document::new(SERVER_REPLICA)
    }

    fn discard_empty_slot(&self, document_id: &DocumentId, slot: &Slot) {
        let mut slots = self.slots.lock();
        if let Some(current) = slots.get(document_id) {
            if Arc::ptr_eq(current, slot) && current.get().is_none() {
                slots.remove(document_id);
            }
        }
    }

    fn resident_entry(&self, document_id: &DocumentId) -> Option<Arc<DocumentEntry>> {
        self.slots.lock().get(document_id)?.get().cloned()
    }

    pub fn is_resident(&self, document_id: &DocumentId) -> bool {
        self.resident_entry(document_id).is_some()
    }

    pub fn resident_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Live handles on `document_id`.
    pub fn handle_count(&self, document_id: &DocumentId) -> usize {
        self.resident_entry(document_id)
            .map_or(0, |entry| entry.refs.load(Ordering::SeqCst))
    }
}
