//! Replicated document state.
//!
//! This module contains the [`Document`] struct: one replica of one document.
//! Elements are kept in a sequence whose order is derived purely from element
//! ids and origins, so any two replicas holding the same elements show the same
//! content no matter in which order the operations arrived.

use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::trace;

use crate::crdt::element::{Element, Payload};
use crate::crdt::operation::{Operation, Update};
use crate::crdt::types::{OperationId, ReplicaId, SERVER_REPLICA, StateVector};
use crate::error::EditError;

/// What happened to one operation passed to [`Document::apply_operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Integrated, together with this many previously buffered operations
    /// (the count includes the operation itself)
    Applied(usize),
    /// Causally unready; held until its dependencies arrive
    Buffered,
    /// Already applied or already buffered
    Duplicate,
    /// Structurally invalid and can never be applied
    Rejected,
}

/// Aggregate result of applying an [`Update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub buffered: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

impl ApplyReport {
    /// True if the visible or tombstone state changed.
    pub fn changed(&self) -> bool {
        self.applied > 0
    }

    /// True if at least one operation was new to this replica.
    pub fn accepted(&self) -> bool {
        self.applied + self.buffered > 0
    }

    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied(n) => self.applied += n,
            ApplyOutcome::Buffered => self.buffered += 1,
            ApplyOutcome::Duplicate => self.duplicates += 1,
            ApplyOutcome::Rejected => self.rejected += 1,
        }
    }
}

/// One replica of a collaboratively edited document.
///
/// # Design
///
/// - Elements are integrated with the YATA rule using both origins, which
///   keeps concurrent runs of text from interleaving
/// - Concurrent siblings at the same origins are ordered by replica id, lower
///   first
/// - Tombstones are never removed
/// - Operations whose dependencies are missing are buffered, never dropped
/// - Every applied operation is kept in a causal log, used for diffs and
///   snapshots
///
/// Positions live in a flat `Vec`, so integrating an element in the middle
/// of a document costs a scan and a shift of the elements after it. Appends
/// near the end, the common case for typing and for rebuilding from a log,
/// stay cheap.
///
/// A `Document` is single-writer: callers serialize access (the registry
/// wraps each one in a mutex).
#[derive(Debug, Clone)]
pub struct Document {
    replica_id: ReplicaId,
    elements: HashMap<OperationId, Element>,
    /// Element ids in document order, tombstones included
    order: Vec<OperationId>,
    /// Applied operations in application order
    log: Vec<Operation>,
    state_vector: StateVector,
    /// Causally unready operations
    pending: Vec<Operation>,
}

impl Document {
    /// Creates an empty document replica.
    ///
    /// Use [`SERVER_REPLICA`] for a replica that only merges remote operations.
    pub fn new(replica_id: ReplicaId) -> Self {
        Document {
            replica_id,
            elements: HashMap::new(),
            order: Vec::new(),
            log: Vec::new(),
            state_vector: StateVector::new(),
            pending: Vec::new(),
        }
    }

    /// Rebuilds a replica by applying `operations` in order.
    pub fn from_operations(
        replica_id: ReplicaId,
        operations: impl IntoIterator<Item = Operation>,
    ) -> Self {
        let mut document = Document::new(replica_id);
        for operation in operations {
            document.apply_operation(operation);
        }
        document
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Summary of every operation applied so far.
    pub fn current_state_vector(&self) -> StateVector {
        self.state_vector.clone()
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    /// Returns true if the operation `id` has been applied.
    pub fn contains(&self, id: OperationId) -> bool {
        self.state_vector.covers(id)
    }

    /// Number of applied operations. Only ever grows.
    pub fn version(&self) -> usize {
        self.log.len()
    }

    /// Number of operations waiting for their dependencies.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Applied operations in causal order.
    pub fn operations(&self) -> &[Operation] {
        &self.log
    }

    /// Largest replica id seen in an applied or buffered operation.
    pub fn max_replica_id(&self) -> Option<ReplicaId> {
        let buffered = self.pending.iter().map(|op| op.id().replica_id).max();
        self.state_vector.max_replica_id().max(buffered)
    }

    /// Applies a single operation, local or remote.
    ///
    /// Idempotent by operation id. An operation whose dependencies are not yet
    /// applied is buffered and integrated as soon as they are.
    pub fn apply_operation(&mut self, operation: Operation) -> ApplyOutcome {
        let id = operation.id();
        if let Err(reason) = operation.validate() {
            trace!("Rejecting operation {}: {}", id, reason);
            return ApplyOutcome::Rejected;
        }
        if self.contains(id) || self.pending.iter().any(|op| op.id() == id) {
            return ApplyOutcome::Duplicate;
        }
        if !self.is_ready(&operation) {
            trace!("Buffering operation {} until its dependencies arrive", id);
            self.pending.push(operation);
            return ApplyOutcome::Buffered;
        }

        self.integrate(operation);
        ApplyOutcome::Applied(1 + self.drain_pending())
    }

    /// Applies every operation of `update` in order.
    pub fn apply_update(&mut self, update: &Update) -> ApplyReport {
        let mut report = ApplyReport::default();
        for operation in &update.operations {
            report.record(self.apply_operation(operation.clone()));
        }
        report
    }

    /// All applied operations not covered by `peer`, in causal order.
    pub fn diff_since(&self, peer: &StateVector) -> Update {
        Update::new(
            self.log
                .iter()
                .filter(|op| !peer.covers(op.id()))
                .cloned()
                .collect(),
        )
    }

    /// Visible payloads in document order.
    ///
    /// The iterator is lazy and borrows the document, so it always reflects
    /// the operations applied when it was created. Clone it to restart.
    pub fn materialize(&self) -> Materialize<'_> {
        Materialize {
            order: self.order.iter(),
            elements: &self.elements,
        }
    }

    /// Number of visible elements.
    pub fn len(&self) -> usize {
        self.materialize().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of elements including tombstones.
    pub fn total_element_count(&self) -> usize {
        self.order.len()
    }

    pub fn element(&self, id: OperationId) -> Option<&Element> {
        self.elements.get(&id)
    }

    /// All elements, tombstones included, in document order.
    pub fn elements(&self) -> impl Iterator<Item = &Element> + '_ {
        self.order.iter().filter_map(|id| self.elements.get(id))
    }

    /// Inserts `payload` so that it becomes the visible element at `index`.
    ///
    /// Returns the generated operation, already applied locally.
    pub fn insert(
        &mut self,
        index: usize,
        payload: impl Into<Payload>,
    ) -> Result<Operation, EditError> {
        let id = self.next_local_id()?;
        let len = self.len();
        if index > len {
            return Err(EditError::IndexOutOfBounds { index, len });
        }
        let origin_left = if index == 0 {
            None
        } else {
            Some(self.visible_id_at(index - 1)?)
        };
        let right_position = match origin_left {
            Some(left) => self.position(left).map_or(0, |p| p + 1),
            None => 0,
        };
        let origin_right = self.order.get(right_position).copied();

        let operation = Operation::Insert {
            id,
            origin_left,
            origin_right,
            payload: payload.into(),
        };
        self.apply_operation(operation.clone());
        Ok(operation)
    }

    /// Inserts every character of `text` starting at `index`.
    pub fn insert_str(&mut self, index: usize, text: &str) -> Result<Vec<Operation>, EditError> {
        text.chars()
            .enumerate()
            .map(|(offset, c)| self.insert(index + offset, c))
            .collect()
    }

    /// Deletes the visible element at `index`.
    pub fn delete(&mut self, index: usize) -> Result<Operation, EditError> {
        let id = self.next_local_id()?;
        let target = self.visible_id_at(index)?;
        let operation = Operation::Delete { id, target };
        self.apply_operation(operation.clone());
        Ok(operation)
    }

    fn next_local_id(&self) -> Result<OperationId, EditError> {
        if self.replica_id == SERVER_REPLICA {
            return Err(EditError::ServerReplica);
        }
        Ok(OperationId::new(
            self.replica_id,
            self.state_vector.next_sequence(self.replica_id),
        ))
    }

    fn visible_id_at(&self, index: usize) -> Result<OperationId, EditError> {
        self.order
            .iter()
            .filter(|id| self.elements.get(id).is_some_and(Element::is_visible))
            .nth(index)
            .copied()
            .ok_or_else(|| EditError::IndexOutOfBounds {
                index,
                len: self.len(),
            })
    }

    /// Searches from the end: typing anchors new elements on recent ones.
    fn position(&self, id: OperationId) -> Option<usize> {
        self.order.iter().rposition(|candidate| *candidate == id)
    }

    fn is_ready(&self, operation: &Operation) -> bool {
        operation.dependencies().all(|dep| self.contains(dep))
    }

    /// Integrates buffered operations that became ready. Returns how many.
    fn drain_pending(&mut self) -> usize {
        let mut integrated = 0;
        while let Some(index) = self.pending.iter().position(|op| self.is_ready(op)) {
            let operation = self.pending.swap_remove(index);
            self.integrate(operation);
            integrated += 1;
        }
        integrated
    }

    /// Integrates a ready, not yet applied operation.
    fn integrate(&mut self, operation: Operation) {
        match &operation {
            Operation::Insert {
                id,
                origin_left,
                origin_right,
                payload,
            } => {
                let element = Element::new(*id, *origin_left, *origin_right, payload.clone());
                let index = self.integration_index(&element);
                self.order.insert(index, element.id);
                self.elements.insert(element.id, element);
            }
            Operation::Delete { target, .. } => {
                if let Some(element) = self.elements.get_mut(target) {
                    element.delete();
                }
            }
        }
        self.state_vector.observe(operation.id());
        self.log.push(operation);
    }

    /// Finds where a new element goes between its origins.
    ///
    /// Scans the elements between the left and right origin. Siblings that
    /// share the left origin are ordered by replica id; elements whose own left
    /// origin lies inside the scanned range belong to a sibling's subtree and
    /// are skipped together with it.
    fn integration_index(&self, element: &Element) -> usize {
        let position_of = |id: Option<OperationId>| id.and_then(|id| self.position(id));

        let mut left = position_of(element.origin_left);
        let start = left.map_or(0, |p| p + 1);
        let end = position_of(element.origin_right).unwrap_or(self.order.len());

        let mut before_origin = HashSet::new();
        let mut conflicting = HashSet::new();

        for index in start..end {
            let Some(other) = self.elements.get(&self.order[index]) else {
                break;
            };
            before_origin.insert(other.id);
            conflicting.insert(other.id);

            if other.origin_left == element.origin_left {
                if other.id.replica_id < element.id.replica_id {
                    left = Some(index);
                    conflicting.clear();
                } else if other.origin_right == element.origin_right {
                    break;
                }
            } else if let Some(other_origin) = other
                .origin_left
                .filter(|origin| before_origin.contains(origin))
            {
                if !conflicting.contains(&other_origin) {
                    left = Some(index);
                    conflicting.clear();
                }
            } else {
                break;
            }
        }

        left.map_or(0, |p| p + 1)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for payload in self.materialize() {
            write!(f, "{payload}")?;
        }
        Ok(())
    }
}

/// Lazy iterator over the visible payloads of a [`Document`].
#[derive(Clone)]
pub struct Materialize<'a> {
    order: std::slice::Iter<'a, OperationId>,
    elements: &'a HashMap<OperationId, Element>,
}

impl<'a> Iterator for Materialize<'a> {
    type Item = &'a Payload;

    fn next(&mut self) -> Option<Self::Item> {
        let elements = self.elements;
        self.order.find_map(|id| {
            elements
                .get(id)
                .filter(|element| element.is_visible())
                .map(|element| &element.payload)
        })
    }
}
