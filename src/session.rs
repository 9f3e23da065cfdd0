//! Server side of the sync protocol for one connection.
//!
//! ```text
//! Joining ──join──► AwaitingStep2 ──SyncStep1|SyncStep2──► Synced
//!    │                    │                                  │
//!    └──── denied ────────┴────────────── close ─────────────┴──► Closed
//! ```
//!
//! On join the server sends `Welcome` then its `SyncStep1`. The client
//! answers with its own `SyncStep1` (answered with a `SyncStep2`) and a
//! `SyncStep2` carrying what the server lacks. Updates are accepted in any
//! state after joining; operations buffer until their dependencies arrive,
//! so ordering across the handshake does not matter.
//!
//! A [`Session`] performs no I/O. It returns the frames to send, and the
//! caller delivers them.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::access::Role;
use crate::codec::SyncMessage;
use crate::crdt::{ReplicaId, Update};
use crate::engine::SyncEngine;
use crate::error::{JoinError, SessionError};
use crate::ids::{ConnectionId, DocumentId, UserId};
use crate::registry::DocumentHandle;

const READ_ONLY_REASON: &str = "read-only role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Joining,
    AwaitingStep2,
    Synced,
    Closed,
}

/// A frame produced by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send to this connection only
    ToSender(Bytes),
    /// Send to every other member of the document's room
    ToRoom(Bytes),
}

pub struct Session {
    engine: Arc<SyncEngine>,
    document_id: DocumentId,
    connection: ConnectionId,
    user: UserId,
    role: Role,
    replica_id: ReplicaId,
    state: SessionState,
    handle: Option<DocumentHandle>,
}

impl Session {
    /// Admits `user` to `document_id` and produces the greeting frames.
    ///
    /// `outbox` receives frames broadcast by other members of the room.
    pub async fn join(
        engine: &Arc<SyncEngine>,
        document_id: DocumentId,
        user: UserId,
        outbox: mpsc::Sender<Bytes>,
    ) -> Result<(Session, Vec<Outbound>), JoinError> {
        let connection = engine.next_connection_id();
        let role = engine
            .rooms()
            .subscribe(&document_id, connection, user.clone(), outbox)
            .await?;

        let handle = match engine.registry().acquire(&document_id).await {
            Ok(handle) => handle,
            Err(e) => {
                engine.rooms().unsubscribe(&document_id, connection);
                return Err(e.into());
            }
        };
        let replica_id = match engine.allocate_replica(&handle) {
            Ok(replica_id) => replica_id,
            Err(e) => {
                warn!("Refusing {user} on {document_id}: {e}");
                engine.rooms().unsubscribe(&document_id, connection);
                return Err(e);
            }
        };
        let state_vector = handle.state_vector();

        let mut session = Session {
            engine: Arc::clone(engine),
            document_id,
            connection,
            user,
            role,
            replica_id,
            state: SessionState::Joining,
            handle: Some(handle),
        };
        // Dropping the session on error releases the handle and membership
        let greeting = vec![
            Outbound::ToSender(to_frame(&SyncMessage::Welcome { replica_id })?),
            Outbound::ToSender(to_frame(&SyncMessage::SyncStep1(state_vector))?),
        ];
        session.state = SessionState::AwaitingStep2;

        info!(
            "{} joined {} as replica {} ({}, {})",
            session.user, session.document_id, replica_id, role, connection
        );
        Ok((session, greeting))
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Handles one binary frame from the client.
    ///
    /// A decode error leaves the document untouched; the caller is expected
    /// to drop the connection.
    pub fn handle_frame(&mut self, frame: &Bytes) -> Result<Vec<Outbound>, SessionError> {
        self.handle()?;
        let message = SyncMessage::decode(frame)?;
        debug!(
            "{} -> {}: {} ({} bytes)",
            self.connection,
            self.document_id,
            message.kind(),
            frame.len()
        );

        match message {
            SyncMessage::SyncStep1(peer) => {
                let diff = self.handle()?.diff_since(&peer);
                self.mark_synced();
                Ok(vec![Outbound::ToSender(to_frame(&SyncMessage::SyncStep2(
                    diff,
                ))?)])
            }
            SyncMessage::SyncStep2(update) => {
                self.mark_synced();
                self.apply(&update, None)
            }
            SyncMessage::Update(update) => self.apply(&update, Some(frame)),
            other => {
                warn!(
                    "Ignoring server-only {} frame from {}",
                    other.kind(),
                    self.connection
                );
                Ok(Vec::new())
            }
        }
    }

    fn mark_synced(&mut self) {
        if self.state == SessionState::AwaitingStep2 {
            debug!("{} synced with {}", self.connection, self.document_id);
            self.state = SessionState::Synced;
        }
    }

    /// Applies client operations. Anything accepted is rebroadcast to the room,
    /// verbatim when the client sent an `Update`.
    fn apply(&self, update: &Update, verbatim: Option<&Bytes>) -> Result<Vec<Outbound>, SessionError> {
        if update.is_empty() {
            return Ok(Vec::new());
        }
        if !self.role.can_edit() {
            warn!(
                "Discarding {} operations from {} ({}, {})",
                update.len(),
                self.user,
                self.role,
                self.connection
            );
            return Ok(vec![Outbound::ToSender(to_frame(&SyncMessage::AccessDenied {
                reason: READ_ONLY_REASON.to_string(),
            })?)]);
        }

        let handle = self.handle()?;
        let report = handle.apply_update(update);
        debug!(
            "{} on {}: {} applied, {} buffered, {} duplicate",
            self.connection, self.document_id, report.applied, report.buffered, report.duplicates
        );

        if report.changed() {
            self.engine.persistence().mark_dirty(&self.document_id);
            self.engine.notify_changed(handle);
        }
        if !report.accepted() {
            return Ok(Vec::new());
        }

        let frame = match verbatim {
            Some(frame) => frame.clone(),
            None => to_frame(&SyncMessage::Update(update.clone()))?,
        };
        Ok(vec![Outbound::ToRoom(frame)])
    }

    fn handle(&self) -> Result<&DocumentHandle, SessionError> {
        self.handle.as_ref().ok_or(SessionError::Closed)
    }

    /// Leaves the room and releases the document. Idempotent.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.engine
            .rooms()
            .unsubscribe(&self.document_id, self.connection);
        if let Some(handle) = self.handle.take() {
            self.engine.registry().release(handle);
        }
        info!("{} left {} ({})", self.user, self.document_id, self.connection);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn to_frame(message: &SyncMessage) -> Result<Bytes, crate::error::EncodeError> {
    message.encode().map(Bytes::from)
}
