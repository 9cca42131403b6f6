//! Client side of docsync
//!
//! [`PeerSync`] keeps a local replica of one document current against an
//! authority reachable through any [`SyncTransport`]; [`RpcClient`] is the
//! transport over frame channels or a WebSocket.

pub mod backoff;
pub mod config;
pub mod engine;
pub mod rpc;
pub mod transport;

pub use backoff::Backoff;
pub use config::PeerConfig;
pub use engine::{PeerError, PeerEvent, PeerSync};
pub use rpc::RpcClient;
pub use transport::{SyncTransport, TransportError};
