//! Element definition for the replicated document.
//!
//! An element is one atomic unit of content (a character or an embedded
//! block) together with the ids it was inserted between.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crdt::types::OperationId;

/// The content carried by one element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Payload {
    /// A single character of text
    Char(char),
    /// An opaque block, e.g. an embed or a formatting marker
    Block(String),
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Char(c) => write!(f, "{c}"),
            Payload::Block(block) => f.write_str(block),
        }
    }
}

impl From<char> for Payload {
    fn from(c: char) -> Self {
        Payload::Char(c)
    }
}

/// Represents a single element within the document.
///
/// Each element contains:
/// - The id of the operation that created it
/// - Its left and right origins: the neighbours it was inserted between
/// - The payload
/// - A deletion flag that acts as a tombstone
///
/// # Tombstone Deletion
///
/// Elements are never physically removed. Concurrent inserts may use a
/// deleted element as their origin, so it has to stay addressable.
/// Only `deleted` ever changes after creation, and only from false to true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub id: OperationId,
    /// Element immediately to the left at insertion time (None = document start)
    pub origin_left: Option<OperationId>,
    /// Element immediately to the right at insertion time (None = document end)
    pub origin_right: Option<OperationId>,
    pub payload: Payload,
    /// Whether this element has been logically deleted (tombstone)
    pub deleted: bool,
}

impl Element {
    /// Creates a new live element.
    pub fn new(
        id: OperationId,
        origin_left: Option<OperationId>,
        origin_right: Option<OperationId>,
        payload: Payload,
    ) -> Self {
        Element {
            id,
            origin_left,
            origin_right,
            payload,
            deleted: false,
        }
    }

    pub fn is_visible(&self) -> bool {
        !self.deleted
    }

    /// Marks this element as deleted.
    ///
    /// Returns true if the element was live before; deleting a tombstone is a
    /// no-op.
    pub fn delete(&mut self) -> bool {
        !std::mem::replace(&mut self.deleted, true)
    }
}
