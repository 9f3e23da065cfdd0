//! State vectors.
//!
//! A state vector maps each replica to the highest sequence number applied
//! from it. Because sequences are applied contiguously, that single number
//! covers every earlier operation of the replica as well.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crdt::types::operation_id::OperationId;
use crate::crdt::types::replica::ReplicaId;

/// Summary of which operations a replica has applied.
///
/// Backed by a `BTreeMap` so that encoding is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ReplicaId, u64>);

impl StateVector {
    /// Creates an empty state vector (nothing seen).
    pub fn new() -> Self {
        StateVector(BTreeMap::new())
    }

    /// Highest sequence seen from `replica_id`, 0 if none.
    pub fn get(&self, replica_id: ReplicaId) -> u64 {
        self.0.get(&replica_id).copied().unwrap_or(0)
    }

    /// Returns true if the operation `id` is covered by this vector.
    pub fn covers(&self, id: OperationId) -> bool {
        id.sequence <= self.get(id.replica_id)
    }

    /// Records that `id` has been applied.
    ///
    /// Callers only observe ids in sequence order, so this just raises the
    /// replica's entry.
    pub fn observe(&mut self, id: OperationId) {
        let entry = self.0.entry(id.replica_id).or_insert(0);
        if id.sequence > *entry {
            *entry = id.sequence;
        }
    }

    /// Next sequence number `replica_id` should use for a new operation.
    pub fn next_sequence(&self, replica_id: ReplicaId) -> u64 {
        self.get(replica_id) + 1
    }

    /// Largest replica id present, if any.
    pub fn max_replica_id(&self) -> Option<ReplicaId> {
        self.0.keys().next_back().copied()
    }

    /// Total number of operations covered.
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates `(replica, highest sequence)` pairs in replica order.
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.0.iter().map(|(replica, sequence)| (*replica, *sequence))
    }
}

impl FromIterator<(ReplicaId, u64)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (ReplicaId, u64)>>(iter: T) -> Self {
        StateVector(iter.into_iter().filter(|(_, seq)| *seq > 0).collect())
    }
}
