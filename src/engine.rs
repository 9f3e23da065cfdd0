//! Composition root of the sync server.
//!
//! [`SyncEngine`] owns the document registry, the room manager and the
//! persistence pipeline, and is handed to every session. There is no global
//! state; tests build as many independent engines as they like.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

use crate::access::AccessControl;
use crate::config::Config;
use crate::crdt::ReplicaId;
use crate::error::JoinError;
use crate::ids::{ConnectionId, DocumentId};
use crate::persistence::{PersistencePipeline, SnapshotStore};
use crate::registry::{DocumentHandle, DocumentRegistry};
use crate::room::RoomManager;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Emitted after a document changed through a sync session.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentChanged {
    pub document_id: DocumentId,
    /// Materialized text after the change
    pub content: String,
    pub version: usize,
    pub changed_at: DateTime<Utc>,
}

pub struct SyncEngine {
    registry: Arc<DocumentRegistry>,
    rooms: RoomManager,
    persistence: Arc<PersistencePipeline>,
    changes: broadcast::Sender<DocumentChanged>,
    outbox_capacity: usize,
    next_connection: AtomicU64,
    next_replica: AtomicU64,
}

impl SyncEngine {
    pub fn new(
        config: &Config,
        store: Arc<dyn SnapshotStore>,
        access: Arc<dyn AccessControl>,
    ) -> Arc<Self> {
        let persistence = Arc::new(PersistencePipeline::new(store, config.persistence.clone()));
        let registry = Arc::new(DocumentRegistry::new(
            Arc::clone(&persistence),
            config.registry.clone(),
        ));
        let rooms = RoomManager::new(access, Arc::clone(&persistence));
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Arc::new(Self {
            registry,
            rooms,
            persistence,
            changes,
            outbox_capacity: config.rooms.outbox_capacity.max(1),
            next_connection: AtomicU64::new(1),
            next_replica: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    pub fn persistence(&self) -> &Arc<PersistencePipeline> {
        &self.persistence
    }

    pub fn outbox_capacity(&self) -> usize {
        self.outbox_capacity
    }

    /// Receives a [`DocumentChanged`] for every change applied through a
    /// session. Slow receivers lag and skip notifications.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<DocumentChanged> {
        self.changes.subscribe()
    }

    pub(crate) fn notify_changed(&self, handle: &DocumentHandle) {
        if self.changes.receiver_count() == 0 {
            return;
        }
        let (content, version) = handle.read(|document| (document.to_string(), document.version()));
        let event = DocumentChanged {
            document_id: handle.document_id().clone(),
            content,
            version,
            changed_at: Utc::now(),
        };
        // Receivers may all have gone away since the check
        let _ = self.changes.send(event);
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection.fetch_add(1, Ordering::SeqCst))
    }

    /// Picks a replica id no operation of the document has used, and that no
    /// other session of this process has been given.
    ///
    /// Fails once a document has an author at `u64::MAX`, or the process has
    /// handed that id out.
    pub fn allocate_replica(&self, handle: &DocumentHandle) -> Result<ReplicaId, JoinError> {
        let exhausted = || JoinError::ReplicasExhausted(handle.document_id().clone());
        let floor = match handle.read(|document| document.max_replica_id()) {
            Some(max) => max.checked_add(1).ok_or_else(exhausted)?,
            None => 1,
        };
        let previous = self
            .next_replica
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                next.max(floor).checked_add(1)
            })
            .map_err(|_| exhausted())?;
        let replica_id = previous.max(floor);
        debug!("Allocated replica {} for {}", replica_id, handle.document_id());
        Ok(replica_id)
    }

    /// Writes every unsaved document. Returns the number of snapshots written.
    pub async fn shutdown(&self) -> usize {
        self.persistence.flush_all().await
    }
}
