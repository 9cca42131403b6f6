use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejection of a single request
///
/// Every variant rejects exactly the request that produced it; an
/// authority that returns one has not touched its log.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ProtocolError {
    /// An operation addresses characters past the end of the document
    #[error("operation at offset {offset} (span {span}) exceeds document length {len}")]
    OutOfBounds { offset: usize, span: usize, len: usize },

    /// A client's own accepted changeset no longer matches what it resent
    #[error("changeset from client {client_id} diverged from the accepted log")]
    Diverged { client_id: u64 },

    /// Request could not be decoded or violates the envelope rules
    #[error("malformed request: {reason}")]
    Malformed { reason: String },

    /// The requested version predates the oldest retained log entry
    #[error("version {requested} was compacted, log starts at {base_version}")]
    Compacted { requested: u64, base_version: u64 },

    /// The connection exceeded its request budget
    #[error("rate limit exceeded")]
    RateLimited,

    /// The document authority is not reachable
    #[error("authority for {document_id} is unavailable")]
    Unavailable { document_id: String },
}

impl ProtocolError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}
