//! Request dispatch from connections to document authorities
//!
//! Each connection gets a reply channel and a cancellation token. Pulls
//! that have to wait are parked in a task that forwards the eventual
//! result to the connection that asked, tagged with its request id, or
//! gives up quietly once the connection is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use docsync_protocol::{
    Changeset, ProtocolError, Reply, ReplyFrame, Request, RequestFrame, Snapshot,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::authority::PullWaiter;
use crate::error::SyncError;
use crate::registry::SharedRegistry;

pub type ConnectionId = u64;

#[derive(Debug)]
struct Connection {
    replies: mpsc::UnboundedSender<ReplyFrame>,
    cancel: CancellationToken,
}

/// In-process connection, for peers living in the host process
#[derive(Debug)]
pub struct LocalConnection {
    pub id: ConnectionId,
    pub requests: mpsc::UnboundedSender<RequestFrame>,
    pub replies: mpsc::UnboundedReceiver<ReplyFrame>,
}

#[derive(Debug)]
pub struct Router {
    registry: SharedRegistry,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    next_connection: AtomicU64,
}

impl Router {
    pub fn new(registry: SharedRegistry) -> Self {
        Self {
            registry,
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection; replies for it arrive on the receiver
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ReplyFrame>) {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (replies, rx) = mpsc::unbounded_channel();
        let connection = Connection {
            replies,
            cancel: CancellationToken::new(),
        };
        self.connections().insert(id, connection);
        tracing::debug!(connection_id = id, "Connection registered");
        (id, rx)
    }

    /// Drop a connection and abandon its outstanding pulls
    pub fn disconnect(&self, id: ConnectionId) {
        let removed = self.connections().remove(&id);
        if let Some(connection) = removed {
            connection.cancel.cancel();
            tracing::debug!(connection_id = id, "Connection removed");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    fn connection(
        &self,
        id: ConnectionId,
    ) -> Option<(mpsc::UnboundedSender<ReplyFrame>, CancellationToken)> {
        self.connections()
            .get(&id)
            .map(|c| (c.replies.clone(), c.cancel.clone()))
    }

    /// Send a reply outside the normal request flow
    pub fn reply(&self, id: ConnectionId, frame: ReplyFrame) -> bool {
        self.connection(id)
            .is_some_and(|(replies, _)| replies.send(frame).is_ok())
    }

    /// Handle one request from `connection`
    ///
    /// Immediate outcomes are sent before this returns; pulls with nothing
    /// to report yet are answered later from a background task.
    pub async fn handle(&self, connection: ConnectionId, frame: RequestFrame) {
        let Some((replies, cancel)) = self.connection(connection) else {
            tracing::warn!(connection_id = connection, "Request from unknown connection");
            return;
        };
        let RequestFrame { id, request } = frame;
        tracing::trace!(
            connection_id = connection,
            request_id = id,
            method = request.method(),
            "Request"
        );

        let outcome = match request {
            Request::Ping => Ok(Reply::Pong),
            Request::Pull {
                document_id,
                version,
            } => match self.pull(&document_id, version).await {
                Ok(waiter) => {
                    tokio::spawn(forward_pull(id, document_id, waiter, replies, cancel));
                    return;
                }
                Err(e) => Err(e),
            },
            Request::Push {
                document_id,
                version,
                changesets,
            } => self
                .push(&document_id, version, changesets)
                .await
                .map(|version| Reply::Accepted {
                    accepted: true,
                    version,
                }),
            Request::GetDocument { document_id } => {
                self.get_document(&document_id).await.map(Reply::Document)
            }
        };

        if replies.send(ReplyFrame { id, outcome }).is_err() {
            tracing::debug!(connection_id = connection, request_id = id, "Reply dropped");
        }
    }

    async fn pull(&self, document_id: &str, version: u64) -> Result<PullWaiter, ProtocolError> {
        let handle = self.registry.get_or_create(document_id).await;
        match handle.pull(version).await {
            Err(SyncError::AuthorityGone { .. }) => {
                let handle = self.registry.replace_failed(&handle).await;
                handle.pull(version).await
            }
            other => other,
        }
        .map_err(|e| e.into_protocol(document_id))
    }

    async fn push(
        &self,
        document_id: &str,
        version: u64,
        changesets: Vec<Changeset>,
    ) -> Result<u64, ProtocolError> {
        let handle = self.registry.get_or_create(document_id).await;
        match handle.push(version, changesets.clone()).await {
            Err(SyncError::AuthorityGone { .. }) => {
                let handle = self.registry.replace_failed(&handle).await;
                handle.push(version, changesets).await
            }
            other => other,
        }
        .map_err(|e| e.into_protocol(document_id))
    }

    async fn get_document(&self, document_id: &str) -> Result<Snapshot, ProtocolError> {
        let handle = self.registry.get_or_create(document_id).await;
        let snapshot = match handle.get_document().await {
            Err(SyncError::AuthorityGone { .. }) => {
                let handle = self.registry.replace_failed(&handle).await;
                handle.get_document().await
            }
            other => other,
        }
        .map_err(|e| e.into_protocol(document_id))?;

        self.registry
            .record_snapshot(document_id, snapshot.clone())
            .await;
        Ok(snapshot)
    }

    /// Open an in-process connection served by this router
    pub fn connect_local(self: &Arc<Self>) -> LocalConnection {
        let (id, replies) = self.connect();
        let (requests, mut incoming) = mpsc::unbounded_channel::<RequestFrame>();
        let router = Arc::clone(self);

        tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                router.handle(id, frame).await;
            }
            router.disconnect(id);
        });

        LocalConnection {
            id,
            requests,
            replies,
        }
    }
}

async fn forward_pull(
    id: u64,
    document_id: String,
    waiter: PullWaiter,
    replies: mpsc::UnboundedSender<ReplyFrame>,
    cancel: CancellationToken,
) {
    let result = tokio::select! {
        () = cancel.cancelled() => return,
        result = waiter => result,
    };
    let outcome = match result {
        Ok(Ok(changesets)) => Ok(Reply::Changesets { changesets }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ProtocolError::Unavailable { document_id }),
    };
    let _ = replies.send(ReplyFrame { id, outcome });
}
