use docsync_protocol::ProtocolError;
use thiserror::Error;

/// Failure inside the host, before it is turned into a reply
#[derive(Debug, Error)]
pub enum SyncError {
    /// The request itself was bad; reported back to the caller
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The authority task has exited (evicted or failed)
    #[error("authority for {document_id} has stopped")]
    AuthorityGone { document_id: String },

    /// Log state that should be impossible; the authority stops
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

impl SyncError {
    /// Reply error for a request on `document_id`
    pub fn into_protocol(self, document_id: &str) -> ProtocolError {
        match self {
            Self::Protocol(e) => e,
            Self::AuthorityGone { .. } | Self::Invariant(_) => ProtocolError::Unavailable {
                document_id: document_id.to_string(),
            },
        }
    }
}
