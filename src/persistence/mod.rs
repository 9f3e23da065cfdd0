//! Durable storage of document snapshots.
//!
//! - [`snapshot`]: binary snapshot format with an integrity checksum
//! - [`store`]: the storage collaborator trait and its backends
//! - [`pipeline`]: debounced, retried flushing of resident documents

pub mod pipeline;
pub mod snapshot;
pub mod store;

pub use pipeline::PersistencePipeline;
pub use snapshot::Snapshot;
pub use store::{FileStore, MemoryStore, SnapshotStore};
