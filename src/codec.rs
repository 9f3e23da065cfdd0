//! Binary protocol for document synchronization.
//!
//! Every WebSocket binary message carries exactly one bincode-encoded
//! [`SyncMessage`]. The enum tag is the message type; the payload follows.
//!
//! ```text
//! ┌──────────┬─────────────────────────────────────────────┐
//! │ tag      │ payload                                     │
//! │ varint   │ StateVector | Update | replica id | reason  │
//! └──────────┴─────────────────────────────────────────────┘
//! ```
//!
//! Decoding is strict: truncated input, trailing bytes, unknown tags and
//! operations that can never become ready are all a [`ProtocolDecodeError`].

use bincode::config::{Config, standard};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::crdt::{Document, ReplicaId, StateVector, Update};
use crate::error::{EncodeError, ProtocolDecodeError};

/// Largest frame or snapshot body the decoder will allocate for.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Server → client, first frame of a session: the replica id allocated to
    /// this session
    Welcome { replica_id: ReplicaId },
    /// Either way: the sender's state vector
    SyncStep1(StateVector),
    /// Either way: operations the receiver is missing, answering a SyncStep1
    SyncStep2(Update),
    /// Either way: incremental operations
    Update(Update),
    /// Server → client: the request was refused
    AccessDenied { reason: String },
}

impl SyncMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        encode_value(self, "sync message")
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolDecodeError> {
        let message: SyncMessage = decode_value(bytes)?;
        match &message {
            SyncMessage::SyncStep2(update) | SyncMessage::Update(update) => {
                validate_update(update)?;
            }
            SyncMessage::Welcome { .. }
            | SyncMessage::SyncStep1(_)
            | SyncMessage::AccessDenied { .. } => {}
        }
        Ok(message)
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Welcome { .. } => "Welcome",
            SyncMessage::SyncStep1(_) => "SyncStep1",
            SyncMessage::SyncStep2(_) => "SyncStep2",
            SyncMessage::Update(_) => "Update",
            SyncMessage::AccessDenied { .. } => "AccessDenied",
        }
    }
}

/// Frame announcing `document`'s state vector.
pub fn encode_sync_step1(document: &Document) -> Result<Vec<u8>, EncodeError> {
    SyncMessage::SyncStep1(document.current_state_vector()).encode()
}

/// Frame carrying every operation of `document` that `peer` has not seen.
pub fn encode_sync_step2(document: &Document, peer: &StateVector) -> Result<Vec<u8>, EncodeError> {
    SyncMessage::SyncStep2(document.diff_since(peer)).encode()
}

/// Bare encoding of an operation set, without a message tag.
pub fn encode_update(update: &Update) -> Result<Vec<u8>, EncodeError> {
    encode_value(update, "update")
}

/// Inverse of [`encode_update`].
pub fn decode_update(bytes: &[u8]) -> Result<Update, ProtocolDecodeError> {
    let update: Update = decode_value(bytes)?;
    validate_update(&update)?;
    Ok(update)
}

fn validate_update(update: &Update) -> Result<(), ProtocolDecodeError> {
    for operation in &update.operations {
        operation.validate().map_err(|reason| {
            ProtocolDecodeError::new(format!("operation {}: {}", operation.id(), reason))
        })?;
    }
    Ok(())
}

fn decode_config() -> impl Config {
    standard().with_limit::<MAX_FRAME_BYTES>()
}

pub(crate) fn encode_value<T: Serialize>(
    value: &T,
    what: &'static str,
) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(value, standard()).map_err(|e| EncodeError {
        what,
        reason: e.to_string(),
    })
}

pub(crate) fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolDecodeError> {
    let (value, consumed) = bincode::serde::decode_from_slice(bytes, decode_config())
        .map_err(|e| ProtocolDecodeError::new(e.to_string()))?;
    if consumed != bytes.len() {
        return Err(ProtocolDecodeError::new(format!(
            "{} trailing bytes after payload",
            bytes.len() - consumed
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{Operation, OperationId, Payload};

    fn sample_update() -> Update {
        let mut doc = Document::new(4);
        doc.insert_str(0, "hi").unwrap();
        doc.insert(1, Payload::Block("<hr>".into())).unwrap();
        doc.delete(0).unwrap();
        doc.diff_since(&StateVector::new())
    }

    #[test]
    fn test_update_roundtrip_preserves_order() {
        let update = sample_update();
        let bytes = encode_update(&update).unwrap();
        let decoded = decode_update(&bytes).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn test_message_roundtrip() {
        let sv: StateVector = [(1, 3), (9, 1)].into_iter().collect();
        for message in [
            SyncMessage::Welcome { replica_id: 12 },
            SyncMessage::SyncStep1(sv),
            SyncMessage::SyncStep2(sample_update()),
            SyncMessage::Update(sample_update()),
            SyncMessage::AccessDenied {
                reason: "not a member".into(),
            },
        ] {
            let bytes = message.encode().unwrap();
            assert_eq!(SyncMessage::decode(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn test_sync_step_helpers() {
        let mut doc = Document::new(2);
        doc.insert_str(0, "abc").unwrap();

        let step1 = SyncMessage::decode(&encode_sync_step1(&doc).unwrap()).unwrap();
        assert_eq!(step1, SyncMessage::SyncStep1(doc.current_state_vector()));

        let peer: StateVector = [(2, 1)].into_iter().collect();
        let step2 = SyncMessage::decode(&encode_sync_step2(&doc, &peer).unwrap()).unwrap();
        match step2 {
            SyncMessage::SyncStep2(update) => assert_eq!(update.len(), 2),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_decode_truncated_payload() {
        let bytes = SyncMessage::Update(sample_update()).encode().unwrap();
        for cut in [0, 1, bytes.len() / 2, bytes.len() - 1] {
            assert!(SyncMessage::decode(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = SyncMessage::Welcome { replica_id: 1 }.encode().unwrap();
        bytes.push(0);
        let err = SyncMessage::decode(&bytes).unwrap_err();
        assert!(err.reason.contains("trailing"));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
        assert!(decode_update(&garbage).is_err());
    }

    #[test]
    fn test_decode_rejects_unreachable_operation() {
        let update = Update::new(vec![Operation::Insert {
            id: OperationId::new(1, 0),
            origin_left: None,
            origin_right: None,
            payload: 'x'.into(),
        }]);
        let bytes = SyncMessage::Update(update).encode().unwrap();
        assert!(SyncMessage::decode(&bytes).is_err());
    }
}
