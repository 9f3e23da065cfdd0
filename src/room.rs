//! Per-document fan-out of frames to connected sessions.
//!
//! Each connection registers an outbox (a bounded channel drained by its
//! socket task). Broadcasting never blocks: a member whose outbox is full or
//! closed is removed from the room, which closes its outbox and ends its
//! connection. The room of a document exists exactly while it has members.

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::access::{AccessControl, Role};
use crate::error::JoinError;
use crate::ids::{ConnectionId, DocumentId, UserId};
use crate::persistence::PersistencePipeline;

struct Member {
    user: UserId,
    outbox: mpsc::Sender<Bytes>,
}

#[derive(Default)]
struct Room {
    members: RwLock<Members>,
}

#[derive(Default)]
struct Members {
    /// Set when the last member leaves; a closed room is about to be removed
    /// from the index and must not take new members
    closed: bool,
    by_connection: HashMap<ConnectionId, Member>,
}

pub struct RoomManager {
    rooms: SkipMap<DocumentId, Arc<Room>>,
    access: Arc<dyn AccessControl>,
    persistence: Arc<PersistencePipeline>,
}

impl RoomManager {
    pub fn new(access: Arc<dyn AccessControl>, persistence: Arc<PersistencePipeline>) -> Self {
        Self {
            rooms: SkipMap::new(),
            access,
            persistence,
        }
    }

    /// Adds a connection to the room of `document_id`.
    ///
    /// Access is checked against the access-control collaborator on every
    /// call. Returns the role the connection was admitted with.
    pub async fn subscribe(
        &self,
        document_id: &DocumentId,
        connection: ConnectionId,
        user: UserId,
        outbox: mpsc::Sender<Bytes>,
    ) -> Result<Role, JoinError> {
        let Some(role) = self.access.authorize(&user, document_id).await else {
            warn!("Denied {user} access to {document_id}");
            return Err(JoinError::AccessDenied(document_id.clone()));
        };

        let mut member = Some(Member { user, outbox });
        loop {
            let room = Arc::clone(
                self.rooms
                    .get_or_insert_with(document_id.clone(), || Arc::new(Room::default()))
                    .value(),
            );
            {
                let mut members = room.members.write();
                if !members.closed {
                    if let Some(member) = member.take() {
                        info!(
                            "{} joined room {} as {} ({} members)",
                            member.user,
                            document_id,
                            role,
                            members.by_connection.len() + 1
                        );
                        members.by_connection.insert(connection, member);
                    }
                    return Ok(role);
                }
            }
            // Closed room still indexed; its remover is about to unlink it
            tokio::task::yield_now().await;
        }
    }

    /// Removes a connection from a room. Returns false if it was not a member.
    ///
    /// When the last member leaves, the room is removed and a final flush of
    /// the document is requested.
    pub fn unsubscribe(&self, document_id: &DocumentId, connection: ConnectionId) -> bool {
        let Some(room) = self.rooms.get(document_id).map(|e| Arc::clone(e.value())) else {
            return false;
        };

        let (removed, emptied) = {
            let mut members = room.members.write();
            let removed = members.by_connection.remove(&connection);
            let emptied = removed.is_some() && members.by_connection.is_empty();
            if emptied {
                members.closed = true;
            }
            (removed, emptied)
        };

        let Some(member) = removed else {
            return false;
        };
        debug!("{} ({}) left room {}", member.user, connection, document_id);

        if emptied {
            self.rooms.remove(document_id);
            info!("Room {document_id} is empty, requesting flush");
            self.persistence.request_flush(document_id);
        }
        true
    }

    /// Queues `frame` for every member except `except`.
    ///
    /// Returns the number of members the frame was queued for.
    pub fn broadcast(&self, document_id: &DocumentId, frame: Bytes, except: ConnectionId) -> usize {
        let Some(room) = self.rooms.get(document_id).map(|e| Arc::clone(e.value())) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for (connection, member) in room.members.read().by_connection.iter() {
            if *connection == except {
                continue;
            }
            match member.outbox.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Outbox of {} ({}) is full, removing it from room {}",
                        member.user, connection, document_id
                    );
                    dropped.push(*connection);
                }
                Err(TrySendError::Closed(_)) => dropped.push(*connection),
            }
        }

        for connection in dropped {
            self.unsubscribe(document_id, connection);
        }
        delivered
    }

    pub fn is_member(&self, document_id: &DocumentId, connection: ConnectionId) -> bool {
        self.rooms
            .get(document_id)
            .is_some_and(|room| room.value().members.read().by_connection.contains_key(&connection))
    }

    pub fn member_count(&self, document_id: &DocumentId) -> usize {
        self.rooms
            .get(document_id)
            .map_or(0, |room| room.value().members.read().by_connection.len())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
