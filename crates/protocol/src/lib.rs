//! Shared protocol types for docsync
//!
//! Changesets and the replica they apply to, the rebase algorithm used by
//! both the authority and its peers, and the request/reply envelope.

pub mod changeset;
pub mod codec;
pub mod document;
pub mod error;
pub mod messages;
pub mod rebase;

pub use changeset::{Changeset, ClientId, Operation};
pub use codec::WireFormat;
pub use document::{Document, Snapshot};
pub use error::ProtocolError;
pub use messages::{DocumentId, Reply, ReplyFrame, Request, RequestFrame};
pub use rebase::{transform, Integrated, PendingChanges};
