// docsync-host library
// Per-document update logs, request routing, WebSocket transport

// Document authorities and their lifecycle
pub mod authority;
pub mod registry;

// Request dispatch
pub mod router;
pub mod ws;

pub mod config;
pub mod error;

pub use authority::{Authority, AuthorityHandle};
pub use error::SyncError;
pub use registry::{AuthorityRegistry, SharedRegistry};
pub use router::{ConnectionId, LocalConnection, Router};
