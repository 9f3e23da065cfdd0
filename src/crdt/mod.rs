//! CRDT (Conflict-free Replicated Data Type) implementation module.
//!
//! This module contains the replicated document and all its supporting
//! types: identifiers, state vectors, elements and operations.

pub mod document;
pub mod element;
pub mod operation;
pub mod types;

// Re-export the main public API
pub use document::{ApplyOutcome, ApplyReport, Document, Materialize};
pub use element::{Element, Payload};
pub use operation::{Operation, Update};
pub use types::{OperationId, ReplicaId, SERVER_REPLICA, StateVector};
