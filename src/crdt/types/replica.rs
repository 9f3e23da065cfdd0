//! Replica identifier type.
//!
//! A replica is one editing session on one document. The server hands out a
//! fresh id to every session when it joins, and never reuses an id while that
//! session is live.

/// A unique identifier for each replica (editing session) of a document.
///
/// Ids are also the tie-break between concurrent inserts at the same position:
/// the lower id is placed to the left.
pub type ReplicaId = u64;

/// Replica id reserved for the server's own copy of a document.
///
/// The server replica only merges operations; it never authors any, so no
/// operation in a valid document carries this id.
pub const SERVER_REPLICA: ReplicaId = 0;
