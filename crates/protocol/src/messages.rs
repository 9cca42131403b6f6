use serde::{Deserialize, Serialize};

use crate::changeset::Changeset;
use crate::document::Snapshot;
use crate::error::ProtocolError;

/// Document identifier, opaque to the engine
pub type DocumentId = String;

/// Synchronization request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    /// Changesets from `version` on; held open while there are none
    Pull { document_id: DocumentId, version: u64 },
    /// Changesets made on top of `version`, oldest first
    Push {
        document_id: DocumentId,
        version: u64,
        changesets: Vec<Changeset>,
    },
    /// Current version and text, for replicas starting from nothing
    GetDocument { document_id: DocumentId },
    /// Transport liveness check, never routed to a document
    Ping,
}

impl Request {
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Pull { .. } => "pull",
            Self::Push { .. } => "push",
            Self::GetDocument { .. } => "getDocument",
            Self::Ping => "ping",
        }
    }

    pub fn document_id(&self) -> Option<&str> {
        match self {
            Self::Pull { document_id, .. }
            | Self::Push { document_id, .. }
            | Self::GetDocument { document_id } => Some(document_id),
            Self::Ping => None,
        }
    }
}

/// Successful reply payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Reply {
    Changesets { changesets: Vec<Changeset> },
    Accepted { accepted: bool, version: u64 },
    Document(Snapshot),
    Pong,
}

/// Request tagged with a caller-chosen id
///
/// Replies may arrive out of order (a pull can wait indefinitely while
/// later pushes complete), so callers match them up by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub id: u64,
    pub outcome: Result<Reply, ProtocolError>,
}

impl ReplyFrame {
    pub const fn ok(id: u64, reply: Reply) -> Self {
        Self {
            id,
            outcome: Ok(reply),
        }
    }

    pub const fn err(id: u64, error: ProtocolError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }
}
