//! Snapshot storage backends.
//!
//! The server talks to storage only through [`SnapshotStore`]. Backends store
//! opaque bytes produced by [`Snapshot::to_bytes`]; integrity is checked on
//! the way back in.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use super::snapshot::Snapshot;
use crate::error::PersistenceError;
use crate::ids::DocumentId;

const SNAPSHOT_EXTENSION: &str = "snapshot";

/// Durable home of document snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Returns the latest snapshot, or `None` if the document was never saved.
    async fn load_snapshot(
        &self,
        document_id: &DocumentId,
    ) -> Result<Option<Snapshot>, PersistenceError>;

    /// Replaces the stored snapshot.
    async fn save_snapshot(
        &self,
        document_id: &DocumentId,
        snapshot: &Snapshot,
    ) -> Result<(), PersistenceError>;
}

/// In-process store. Used when no data directory is configured, and by tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<DocumentId, Vec<u8>>>,
    failing_writes: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores raw bytes as the snapshot of `document_id`, bypassing encoding.
    pub fn put_raw(&self, document_id: DocumentId, bytes: Vec<u8>) {
        self.snapshots.lock().insert(document_id, bytes);
    }

    pub fn raw(&self, document_id: &DocumentId) -> Option<Vec<u8>> {
        self.snapshots.lock().get(document_id).cloned()
    }

    pub fn contains(&self, document_id: &DocumentId) -> bool {
        self.snapshots.lock().contains_key(document_id)
    }

    /// Makes the next `count` saves fail with [`PersistenceError::Unavailable`].
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load_snapshot(
        &self,
        document_id: &DocumentId,
    ) -> Result<Option<Snapshot>, PersistenceError> {
        match self.raw(document_id) {
            Some(bytes) => Snapshot::from_bytes(document_id, &bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn save_snapshot(
        &self,
        document_id: &DocumentId,
        snapshot: &Snapshot,
    ) -> Result<(), PersistenceError> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PersistenceError::Unavailable(format!(
                "injected write failure for {document_id}"
            )));
        }

        let bytes = snapshot.to_bytes()?;
        self.snapshots.lock().insert(document_id.clone(), bytes);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One file per document under a data directory.
///
/// Saves go to a temporary file that is then renamed over the snapshot, so a
/// crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens the store, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Document ids are restricted to `[A-Za-z0-9_-]`, so they are safe as
    /// file names.
    pub fn snapshot_path(&self, document_id: &DocumentId) -> PathBuf {
        self.root
            .join(format!("{}.{}", document_id, SNAPSHOT_EXTENSION))
    }
}

#[async_trait]
impl SnapshotStore for FileStore {
    async fn load_snapshot(
        &self,
        document_id: &DocumentId,
    ) -> Result<Option<Snapshot>, PersistenceError> {
        let path = self.snapshot_path(document_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        debug!("Read {} bytes from {}", bytes.len(), path.display());
        Snapshot::from_bytes(document_id, &bytes).map(Some)
    }

    async fn save_snapshot(
        &self,
        document_id: &DocumentId,
        snapshot: &Snapshot,
    ) -> Result<(), PersistenceError> {
        let bytes = snapshot.to_bytes()?;
        let path = self.snapshot_path(document_id);
        let staging = path.with_extension(format!("{SNAPSHOT_EXTENSION}.tmp"));

        tokio::fs::write(&staging, &bytes).await?;
        tokio::fs::rename(&staging, &path).await?;
        debug!("Wrote {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }
}
