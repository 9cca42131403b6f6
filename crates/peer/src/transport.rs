//! Request/reply seam between the sync engine and the network

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docsync_protocol::{ProtocolError, Reply, Request};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("request timed out")]
    Timeout,
    #[error("could not connect: {0}")]
    Connect(String),
    /// The authority answered with an error
    #[error(transparent)]
    Remote(#[from] ProtocolError),
}

/// Sends one request and waits for its reply
///
/// `timeout` of `None` waits as long as the authority takes, which is
/// what long-polling pulls want.
#[async_trait]
pub trait SyncTransport: Send + Sync + 'static {
    async fn call(&self, request: Request, timeout: Option<Duration>) -> Result<Reply, TransportError>;
}

#[async_trait]
impl<T: SyncTransport + ?Sized> SyncTransport for Arc<T> {
    async fn call(&self, request: Request, timeout: Option<Duration>) -> Result<Reply, TransportError> {
        (**self).call(request, timeout).await
    }
}
