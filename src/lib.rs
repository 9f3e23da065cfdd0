//! # collab-sync - real-time document synchronization server
//!
//! Clients edit a shared text document over WebSocket. Every document is a
//! sequence CRDT replica: concurrent edits merge deterministically, and any
//! two replicas that applied the same operations show the same content.
//!
//! ## Layout
//!
//! - [`crdt`]: the replicated document, its operations and state vectors
//! - [`codec`]: binary wire format of the sync protocol
//! - [`session`]: per-connection protocol state machine
//! - [`registry`]: one resident document per id, reference counted, evicted when idle
//! - [`room`]: fan-out of updates to the connections of a document
//! - [`persistence`]: checksummed snapshots, debounced and retried writes
//! - [`engine`]: composition of the above
//! - [`server`]: Axum routes and the WebSocket driver
//!
//! ## Example
//!
//! ```rust
//! use collab_sync::crdt::{Document, StateVector};
//!
//! let mut alice = Document::new(1);
//! let mut bob = Document::new(2);
//! alice.insert_str(0, "hello").unwrap();
//! bob.insert_str(0, "world").unwrap();
//!
//! let to_bob = alice.diff_since(bob.state_vector());
//! let to_alice = bob.diff_since(alice.state_vector());
//! bob.apply_update(&to_bob);
//! alice.apply_update(&to_alice);
//!
//! assert_eq!(alice.to_string(), bob.to_string());
//! ```

pub mod access;
pub mod codec;
pub mod config;
pub mod crdt;
pub mod engine;
pub mod error;
pub mod ids;
pub mod persistence;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;

pub use access::{AccessControl, Role, StaticAccessControl, TokenVerifier};
pub use codec::SyncMessage;
pub use config::Config;
pub use crdt::{Document, Operation, OperationId, ReplicaId, StateVector, Update};
pub use engine::{DocumentChanged, SyncEngine};
pub use ids::{ConnectionId, DocumentId, UserId};
pub use persistence::{FileStore, MemoryStore, Snapshot, SnapshotStore};
pub use registry::{DocumentHandle, DocumentRegistry};
pub use session::{Outbound, Session, SessionState};
