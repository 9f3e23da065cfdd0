//! Operations exchanged between replicas.

use serde::{Deserialize, Serialize};

use crate::crdt::element::Payload;
use crate::crdt::types::{OperationId, SERVER_REPLICA};

/// A single replicated edit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Creates a new element between two existing ones
    Insert {
        id: OperationId,
        origin_left: Option<OperationId>,
        origin_right: Option<OperationId>,
        payload: Payload,
    },
    /// Tombstones an existing element
    Delete { id: OperationId, target: OperationId },
}

impl Operation {
    pub fn id(&self) -> OperationId {
        match self {
            Operation::Insert { id, .. } | Operation::Delete { id, .. } => *id,
        }
    }

    /// Ids that must be applied before this operation can be.
    ///
    /// This is the replica's previous operation plus every element the
    /// operation refers to.
    pub fn dependencies(&self) -> impl Iterator<Item = OperationId> {
        let (first, second) = match self {
            Operation::Insert {
                origin_left,
                origin_right,
                ..
            } => (*origin_left, *origin_right),
            Operation::Delete { target, .. } => (Some(*target), None),
        };
        self.id()
            .predecessor()
            .into_iter()
            .chain(first)
            .chain(second)
    }

    /// Structural checks that do not depend on document state.
    ///
    /// Rejects ids that can never become ready: sequence 0, the server replica,
    /// or a reference to the same replica's own future.
    pub fn validate(&self) -> Result<(), &'static str> {
        let id = self.id();
        if id.sequence == 0 {
            return Err("operation sequence must start at 1");
        }
        if id.replica_id == SERVER_REPLICA {
            return Err("operation authored by the reserved server replica");
        }
        let self_reference = self
            .dependencies()
            .any(|dep| dep.replica_id == id.replica_id && dep.sequence >= id.sequence);
        if self_reference {
            return Err("operation depends on itself or a later operation");
        }
        Ok(())
    }
}

/// An ordered batch of operations, as carried by `SyncStep2` and `Update`.
///
/// Order matters only for efficiency: senders emit operations in the order
/// they were applied, which is causal, so receivers rarely need to buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub operations: Vec<Operation>,
}

impl Update {
    pub fn new(operations: Vec<Operation>) -> Self {
        Update { operations }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

impl From<Vec<Operation>> for Update {
    fn from(operations: Vec<Operation>) -> Self {
        Update { operations }
    }
}
