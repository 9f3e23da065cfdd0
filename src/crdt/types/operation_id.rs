//! Operation identifiers.
//!
//! Every operation (insert or delete) is named by the replica that generated
//! it and that replica's sequence counter. Sequences start at 1 and are
//! contiguous, which is what lets a [`StateVector`](super::StateVector)
//! summarise "everything seen so far" with one number per replica.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crdt::types::replica::ReplicaId;

/// Globally unique identifier of an operation and of the element it created.
///
/// Ordering is by replica first, then sequence. It is only used to make
/// collections deterministic; document order is derived from origins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OperationId {
    /// The replica that generated this operation
    pub replica_id: ReplicaId,
    /// Per-replica sequence number, starting at 1
    pub sequence: u64,
}

impl OperationId {
    /// Creates a new OperationId
    pub fn new(replica_id: ReplicaId, sequence: u64) -> Self {
        OperationId {
            replica_id,
            sequence,
        }
    }

    /// The id this replica generated just before this one, if any.
    pub fn predecessor(&self) -> Option<OperationId> {
        if self.sequence > 1 {
            Some(OperationId::new(self.replica_id, self.sequence - 1))
        } else {
            None
        }
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.sequence, self.replica_id)
    }
}
