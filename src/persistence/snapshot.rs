//! Snapshot format.
//!
//! ```text
//! envelope = { format: u8, checksum: blake3(body), body }
//! body     = { state_vector, operations (causal order) }
//! ```
//!
//! Both layers are bincode. A checksum mismatch, an unknown format or a body
//! that does not rebuild to its recorded state vector is reported as
//! [`PersistenceError::Corrupt`].

use serde::{Deserialize, Serialize};

use crate::codec::{decode_value, encode_value};
use crate::crdt::{Document, Operation, SERVER_REPLICA, StateVector};
use crate::error::{EncodeError, PersistenceError};
use crate::ids::DocumentId;

const SNAPSHOT_FORMAT: u8 = 1;

/// Full state of a document at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state_vector: StateVector,
    pub operations: Vec<Operation>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    format: u8,
    checksum: [u8; 32],
    body: Vec<u8>,
}

impl Snapshot {
    /// Captures the applied state of `document`. Buffered operations are not
    /// included; their senders will resend them after a reload.
    pub fn capture(document: &Document) -> Self {
        Snapshot {
            state_vector: document.current_state_vector(),
            operations: document.operations().to_vec(),
        }
    }

    /// Rebuilds the server replica of the document.
    pub fn restore(&self, document_id: &DocumentId) -> Result<Document, PersistenceError> {
        let document = Document::from_operations(SERVER_REPLICA, self.operations.iter().cloned());
        if document.pending_len() > 0 || document.state_vector() != &self.state_vector {
            return Err(PersistenceError::Corrupt {
                document_id: document_id.clone(),
                reason: "operations do not rebuild the recorded state vector".to_string(),
            });
        }
        Ok(document)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let body = encode_value(self, "snapshot body")?;
        let envelope = Envelope {
            format: SNAPSHOT_FORMAT,
            checksum: *blake3::hash(&body).as_bytes(),
            body,
        };
        encode_value(&envelope, "snapshot envelope")
    }

    pub fn from_bytes(document_id: &DocumentId, bytes: &[u8]) -> Result<Self, PersistenceError> {
        let corrupt = |reason: String| PersistenceError::Corrupt {
            document_id: document_id.clone(),
            reason,
        };

        let envelope: Envelope = decode_value(bytes).map_err(|e| corrupt(e.to_string()))?;
        if envelope.format != SNAPSHOT_FORMAT {
            return Err(corrupt(format!("unknown format {}", envelope.format)));
        }
        if blake3::hash(&envelope.body) != blake3::Hash::from(envelope.checksum) {
            return Err(corrupt("checksum mismatch".to_string()));
        }
        decode_value(&envelope.body).map_err(|e| corrupt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_id() -> DocumentId {
        DocumentId::parse("snap-test").unwrap()
    }

    fn sample_document() -> Document {
        let mut doc = Document::new(3);
        doc.insert_str(0, "snapshot").unwrap();
        doc.delete(0).unwrap();
        doc
    }

    #[test]
    fn test_snapshot_restores_identical_content() {
        let doc = sample_document();
        let bytes = Snapshot::capture(&doc).to_bytes().unwrap();

        let restored = Snapshot::from_bytes(&doc_id(), &bytes)
            .unwrap()
            .restore(&doc_id())
            .unwrap();
        assert_eq!(restored.to_string(), "napshot");
        assert_eq!(restored.state_vector(), doc.state_vector());
        assert_eq!(restored.replica_id(), SERVER_REPLICA);
    }

    #[test]
    fn test_flipped_bit_fails_checksum() {
        let mut bytes = Snapshot::capture(&sample_document()).to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        let err = Snapshot::from_bytes(&doc_id(), &bytes).unwrap_err();
        assert!(matches!(err, PersistenceError::Corrupt { .. }));
    }

    #[test]
    fn test_truncated_snapshot_is_corrupt() {
        let bytes = Snapshot::capture(&sample_document()).to_bytes().unwrap();
        let err = Snapshot::from_bytes(&doc_id(), &bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, PersistenceError::Corrupt { .. }));
    }

    #[test]
    fn test_inconsistent_state_vector_is_corrupt() {
        let mut snapshot = Snapshot::capture(&sample_document());
        snapshot.state_vector = [(3, 99)].into_iter().collect();
        assert!(snapshot.restore(&doc_id()).is_err());
    }
}
