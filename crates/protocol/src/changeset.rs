//! Changesets: position-addressed text edits tagged with their author
//!
//! Offsets and lengths count `char`s. Operations inside one changeset
//! apply in order, each relative to the text left by the ones before it.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Opaque identifier of the replica that produced a changeset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl ClientId {
    /// Draw a fresh identifier for a new replica session
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A single span edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Insert { offset: usize, text: String },
    Delete { offset: usize, len: usize },
}

impl Operation {
    /// Length of a document of `len` chars after this operation
    pub fn target_len(&self, len: usize) -> Result<usize, ProtocolError> {
        match self {
            Self::Insert { offset, text } => {
                if *offset > len {
                    return Err(ProtocolError::OutOfBounds {
                        offset: *offset,
                        span: 0,
                        len,
                    });
                }
                Ok(len + text.chars().count())
            }
            Self::Delete { offset, len: span } => {
                match offset.checked_add(*span) {
                    Some(end) if end <= len => Ok(len - span),
                    _ => Err(ProtocolError::OutOfBounds {
                        offset: *offset,
                        span: *span,
                        len,
                    }),
                }
            }
        }
    }

    /// True if applying this operation leaves any text unchanged
    pub fn is_noop(&self) -> bool {
        match self {
            Self::Insert { text, .. } => text.is_empty(),
            Self::Delete { len, .. } => *len == 0,
        }
    }
}

/// An immutable description of a text edit made by one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Changeset {
    pub origin_client_id: ClientId,
    pub operations: Vec<Operation>,
}

impl Changeset {
    pub const fn new(origin_client_id: ClientId, operations: Vec<Operation>) -> Self {
        Self {
            origin_client_id,
            operations,
        }
    }

    /// Changeset inserting `text` at `offset`
    pub fn insert(origin_client_id: ClientId, offset: usize, text: impl Into<String>) -> Self {
        Self::new(
            origin_client_id,
            vec![Operation::Insert {
                offset,
                text: text.into(),
            }],
        )
    }

    /// Changeset deleting `len` chars starting at `offset`
    pub fn delete(origin_client_id: ClientId, offset: usize, len: usize) -> Self {
        Self::new(origin_client_id, vec![Operation::Delete { offset, len }])
    }

    /// Replace `len` chars at `offset` with `text`
    pub fn replace(
        origin_client_id: ClientId,
        offset: usize,
        len: usize,
        text: impl Into<String>,
    ) -> Self {
        Self::new(
            origin_client_id,
            vec![
                Operation::Delete { offset, len },
                Operation::Insert {
                    offset,
                    text: text.into(),
                },
            ],
        )
    }

    /// Document length after applying this changeset to `base_len` chars
    ///
    /// Fails with `OutOfBounds` if any operation leaves the document.
    pub fn target_len(&self, base_len: usize) -> Result<usize, ProtocolError> {
        self.operations
            .iter()
            .try_fold(base_len, |len, op| op.target_len(len))
    }

    pub fn is_noop(&self) -> bool {
        self.operations.iter().all(Operation::is_noop)
    }
}
