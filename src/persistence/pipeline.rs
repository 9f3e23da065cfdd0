//! Debounced snapshot writes.
//!
//! Every resident document is tracked here by a weak reference. Changes call
//! [`PersistencePipeline::mark_dirty`], which schedules at most one pending
//! flush per document; a burst of updates within the debounce window becomes
//! a single write. Failed writes are retried with exponential backoff.
//!
//! A flush snapshots the document under its lock and writes outside it, so
//! edits never wait on storage.

use crossbeam_skiplist::SkipMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use super::snapshot::Snapshot;
use super::store::SnapshotStore;
use crate::config::PersistenceConfig;
use crate::error::PersistenceError;
use crate::ids::DocumentId;
use crate::registry::DocumentEntry;

pub struct PersistencePipeline {
    store: Arc<dyn SnapshotStore>,
    config: PersistenceConfig,
    tracked: SkipMap<DocumentId, Weak<DocumentEntry>>,
}

impl PersistencePipeline {
    pub fn new(store: Arc<dyn SnapshotStore>, config: PersistenceConfig) -> Self {
        Self {
            store,
            config,
            tracked: SkipMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    pub(crate) fn track(&self, entry: &Arc<DocumentEntry>) {
        self.tracked
            .insert(entry.id().clone(), Arc::downgrade(entry));
    }

    /// Stops tracking `entry`. A newer entry for the same id is left alone.
    pub(crate) fn untrack(&self, entry: &Arc<DocumentEntry>) {
        if let Some(tracked) = self.tracked.get(entry.id()) {
            if std::ptr::eq(tracked.value().as_ptr(), Arc::as_ptr(entry)) {
                tracked.remove();
            }
        }
    }

    fn tracked_entry(&self, document_id: &DocumentId) -> Option<Arc<DocumentEntry>> {
        self.tracked.get(document_id)?.value().upgrade()
    }

    /// Number of documents the pipeline is responsible for.
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Schedules a flush of `document_id` after the debounce window, unless
    /// one is already pending.
    pub fn mark_dirty(self: &Arc<Self>, document_id: &DocumentId) {
        let Some(entry) = self.tracked_entry(document_id) else {
            debug!("Ignoring mark_dirty for non-resident document {document_id}");
            return;
        };
        if entry.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let pipeline = Arc::clone(self);
        let debounce = self.config.debounce();
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            entry.flush_scheduled.store(false, Ordering::SeqCst);
            if let Err(e) = pipeline.flush_entry(&entry).await {
                error!("Giving up on flush of {}: {}", entry.id(), e);
            }
        });
    }

    /// Flushes `document_id` right away in the background.
    pub fn request_flush(self: &Arc<Self>, document_id: &DocumentId) {
        let Some(entry) = self.tracked_entry(document_id) else {
            return;
        };
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = pipeline.flush_entry(&entry).await {
                error!("Giving up on flush of {}: {}", entry.id(), e);
            }
        });
    }

    /// Writes a snapshot of `document_id` if it has unsaved changes.
    ///
    /// Returns `Ok(true)` if a snapshot was written, `Ok(false)` if the
    /// document is clean or not resident.
    pub async fn flush(&self, document_id: &DocumentId) -> Result<bool, PersistenceError> {
        match self.tracked_entry(document_id) {
            Some(entry) => self.flush_entry(&entry).await,
            None => Ok(false),
        }
    }

    /// Final flush before an entry leaves memory.
    pub(crate) async fn flush_on_evict(
        &self,
        entry: &DocumentEntry,
    ) -> Result<bool, PersistenceError> {
        let written = self.flush_entry(entry).await?;
        if written {
            info!("Flushed {} before eviction", entry.id());
        }
        Ok(written)
    }

    /// Flushes every tracked document. Used on shutdown.
    pub async fn flush_all(&self) -> usize {
        let entries: Vec<_> = self
            .tracked
            .iter()
            .filter_map(|tracked| tracked.value().upgrade())
            .collect();

        let mut written = 0;
        for entry in entries {
            match self.flush_entry(&entry).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to flush {} on shutdown: {}", entry.id(), e),
            }
        }
        written
    }

    pub(crate) async fn flush_entry(&self, entry: &DocumentEntry) -> Result<bool, PersistenceError> {
        let _serialized = entry.flush_lock.lock().await;

        let (snapshot, version) = {
            let document = entry.document.lock();
            if document.version() <= entry.flushed_version() {
                return Ok(false);
            }
            (Snapshot::capture(&document), document.version())
        };

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.store.save_snapshot(entry.id(), &snapshot).await {
                Ok(()) => {
                    entry.mark_flushed(version);
                    debug!("Saved snapshot of {} at version {}", entry.id(), version);
                    return Ok(true);
                }
                Err(e) if attempt < max_attempts => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        "Snapshot write for {} failed (attempt {}/{}), retrying in {:?}: {}",
                        entry.id(),
                        attempt,
                        max_attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for PersistencePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistencePipeline")
            .field("config", &self.config)
            .field("tracked", &self.tracked.len())
            .finish()
    }
}
