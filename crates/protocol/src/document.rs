//! Document replica
//!
//! A text buffer that changesets are applied to. Pure: applying returns a
//! new buffer and never leaves a half-edited one behind.

use serde::{Deserialize, Serialize};

use crate::changeset::{Changeset, Operation};
use crate::error::ProtocolError;

/// Document text with a cached char length
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    text: String,
    len: usize,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let len = text.chars().count();
        Self { text, len }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    /// Length in chars
    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Apply a changeset, producing the edited buffer
    pub fn apply(&self, changeset: &Changeset) -> Result<Self, ProtocolError> {
        changeset.target_len(self.len)?;

        let mut next = self.clone();
        for op in &changeset.operations {
            next.apply_operation(op);
        }
        Ok(next)
    }

    fn apply_operation(&mut self, op: &Operation) {
        match op {
            Operation::Insert { offset, text } => {
                let at = self.byte_offset(*offset);
                self.text.insert_str(at, text);
                self.len += text.chars().count();
            }
            Operation::Delete { offset, len } => {
                let start = self.byte_offset(*offset);
                let end = self.byte_offset(offset + len);
                self.text.replace_range(start..end, "");
                self.len -= len;
            }
        }
    }

    fn byte_offset(&self, chars: usize) -> usize {
        self.text
            .char_indices()
            .nth(chars)
            .map_or(self.text.len(), |(idx, _)| idx)
    }
}

impl From<&str> for Document {
    fn from(text: &str) -> Self {
        Self::from_text(text)
    }
}

/// Document state at a given version
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    pub text: String,
}

impl Snapshot {
    pub fn new(version: u64, text: impl Into<String>) -> Self {
        Self {
            version,
            text: text.into(),
        }
    }
}
