//! Error types for the sync engine.
//!
//! Errors are scoped to what they affect: decode and access failures belong
//! to one connection, persistence failures to one flush, registry failures to
//! one acquire call. None of them is ever propagated to other subscribers.
//!
//! Concurrent, divergent edits are not represented here at all. They are
//! resolved by integration order and are never an error.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::ids::DocumentId;

/// A document id that is not syntactically valid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid document id {0:?}: expected 1-128 characters from [A-Za-z0-9_-]")]
pub struct InvalidDocumentId(pub String);

/// Errors from local edits on a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditError {
    #[error("index {index} is out of bounds for a document of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("the server replica cannot author operations")]
    ServerReplica,
}

/// Malformed, truncated or semantically invalid binary payload.
///
/// The connection that sent it is dropped; the room and the document are
/// left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed sync payload: {reason}")]
pub struct ProtocolDecodeError {
    pub reason: String,
}

impl ProtocolDecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Serialization failure while producing a frame or snapshot.
#[derive(Debug, Clone, Error)]
#[error("failed to encode {what}: {reason}")]
pub struct EncodeError {
    pub what: &'static str,
    pub reason: String,
}

/// Errors that can occur while loading or storing snapshots.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// I/O error from the backing storage
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Stored snapshot failed its integrity check
    #[error("snapshot for document {document_id} failed integrity check: {reason}")]
    Corrupt {
        document_id: DocumentId,
        reason: String,
    },

    /// Storage refused the request (transient)
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Errors from [`DocumentRegistry::acquire`](crate::registry::DocumentRegistry::acquire).
///
/// Both variants are scoped to the failing call and safe to retry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("timed out after {timeout:?} waiting for document {document_id} to load")]
    RaceTimeout {
        document_id: DocumentId,
        timeout: Duration,
    },

    #[error("failed to load document {document_id}: {source}")]
    Load {
        document_id: DocumentId,
        #[source]
        source: PersistenceError,
    },
}

/// Errors from joining a document session.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("access denied to document {0}")]
    AccessDenied(DocumentId),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Every replica id above the document's authors is taken
    #[error("no replica id left for document {0}")]
    ReplicasExhausted(DocumentId),
}

/// Errors raised while handling one frame of an established session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Decode(#[from] ProtocolDecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("session is closed")]
    Closed,
}

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("auth.token_secret must not be empty")]
    MissingSecret,
}
