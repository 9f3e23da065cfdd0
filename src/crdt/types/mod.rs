//! Type definitions for the replicated document.
//!
//! This module contains the identifier types used throughout the CRDT,
//! organized into focused submodules.

pub mod operation_id;
pub mod replica;
pub mod state_vector;

pub use operation_id::OperationId;
pub use replica::{ReplicaId, SERVER_REPLICA};
pub use state_vector::StateVector;
