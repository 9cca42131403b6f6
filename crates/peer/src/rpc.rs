//! Request/reply correlation over a frame channel
//!
//! Outgoing requests get a fresh id and a oneshot slot in the pending map;
//! the reader task completes the slot when the reply with that id comes
//! back. Slots are removed on timeout so late replies are ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use docsync_protocol::{ProtocolError, Reply, ReplyFrame, Request, RequestFrame, WireFormat};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::transport::{SyncTransport, TransportError};

/// Map of pending request ids to their completion channels
type RequestMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Reply, ProtocolError>>>>>;

fn lock(requests: &RequestMap) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Reply, ProtocolError>>>> {
    requests.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drops the pending slot when a call ends, however it ends
struct PendingSlot<'a> {
    requests: &'a RequestMap,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock(self.requests).remove(&self.id);
    }
}

#[derive(Debug)]
pub struct RpcClient {
    next_id: AtomicU64,
    outbound: mpsc::UnboundedSender<RequestFrame>,
    requests: RequestMap,
    closed: CancellationToken,
    reader: JoinHandle<()>,
}

impl RpcClient {
    /// Client over an existing pair of frame channels
    pub fn new(
        outbound: mpsc::UnboundedSender<RequestFrame>,
        mut inbound: mpsc::UnboundedReceiver<ReplyFrame>,
    ) -> Self {
        let requests: RequestMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        let reader_requests = requests.clone();
        let reader_closed = closed.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                let slot = lock(&reader_requests).remove(&frame.id);
                match slot {
                    Some(tx) => {
                        let _ = tx.send(frame.outcome);
                    }
                    None => tracing::debug!(request_id = frame.id, "Reply for unknown or expired request"),
                }
            }
            reader_closed.cancel();
            lock(&reader_requests).clear();
        });

        Self {
            next_id: AtomicU64::new(1),
            outbound,
            requests,
            closed,
            reader,
        }
    }

    /// Connect to a host over WebSocket, speaking MessagePack
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();
        tracing::debug!(url, "Connected to host");

        let (outbound, mut requests) = mpsc::unbounded_channel::<RequestFrame>();
        let (replies, inbound) = mpsc::unbounded_channel::<ReplyFrame>();

        tokio::spawn(async move {
            while let Some(frame) = requests.recv().await {
                let bytes = match WireFormat::MessagePack.encode(&frame) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(request_id = frame.id, error = %e, "Request encode failed");
                        continue;
                    }
                };
                if sink.send(Message::Binary(bytes)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Binary(data)) => match WireFormat::MessagePack.decode(&data) {
                        Ok(frame) => {
                            if replies.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Dropping undecodable reply"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "WebSocket read failed");
                        break;
                    }
                }
            }
        });

        Ok(Self::new(outbound, inbound))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Requests still waiting for a reply
    pub fn in_flight(&self) -> usize {
        lock(&self.requests).len()
    }
}

#[async_trait]
impl SyncTransport for RpcClient {
    async fn call(&self, request: Request, timeout: Option<Duration>) -> Result<Reply, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.requests).insert(id, tx);
        let _slot = PendingSlot {
            requests: &self.requests,
            id,
        };

        // Registered after the reader gave up: nobody will ever answer.
        if self.closed.is_cancelled() || self.outbound.send(RequestFrame { id, request }).is_err() {
            return Err(TransportError::Closed);
        }

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::debug!(request_id = id, "Request timed out");
                    return Err(TransportError::Timeout);
                }
            },
            None => rx.await,
        };

        outcome
            .map_err(|_| TransportError::Closed)?
            .map_err(TransportError::Remote)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (
        RpcClient,
        mpsc::UnboundedReceiver<RequestFrame>,
        mpsc::UnboundedSender<ReplyFrame>,
    ) {
        let (outbound, requests) = mpsc::unbounded_channel();
        let (replies, inbound) = mpsc::unbounded_channel();
        (RpcClient::new(outbound, inbound), requests, replies)
    }

    #[tokio::test]
    async fn replies_are_matched_by_id() {
        let (client, mut requests, replies) = client();
        let client = Arc::new(client);

        let first = tokio::spawn({
            let client = client.clone();
            async move { client.call(Request::Ping, None).await }
        });
        let second = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .call(
                        Request::GetDocument {
                            document_id: "doc".into(),
                        },
                        None,
                    )
                    .await
            }
        });

        let a = requests.recv().await.unwrap();
        let b = requests.recv().await.unwrap();
        // Answer out of order.
        for frame in [&b, &a] {
            let outcome = match frame.request {
                Request::Ping => Ok(Reply::Pong),
                _ => Err(ProtocolError::Unavailable {
                    document_id: "doc".into(),
                }),
            };
            replies.send(ReplyFrame { id: frame.id, outcome }).unwrap();
        }

        assert_eq!(first.await.unwrap(), Ok(Reply::Pong));
        assert_eq!(
            second.await.unwrap(),
            Err(TransportError::Remote(ProtocolError::Unavailable {
                document_id: "doc".into()
            }))
        );
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn timeout_forgets_the_request() {
        let (client, mut requests, replies) = client();
        let result = client
            .call(Request::Ping, Some(Duration::from_millis(20)))
            .await;
        assert_eq!(result, Err(TransportError::Timeout));
        assert_eq!(client.in_flight(), 0);

        // A late reply is ignored.
        let late = requests.recv().await.unwrap();
        replies.send(ReplyFrame::ok(late.id, Reply::Pong)).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn abandoned_call_forgets_the_request() {
        let (client, mut requests, _replies) = client();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            client.call(Request::Ping, None),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(requests.recv().await.is_some());
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn closed_channel_fails_waiting_calls() {
        let (client, _requests, replies) = client();
        let client = Arc::new(client);
        let waiting = tokio::spawn({
            let client = client.clone();
            async move { client.call(Request::Ping, None).await }
        });
        tokio::task::yield_now().await;
        drop(replies);

        assert_eq!(waiting.await.unwrap(), Err(TransportError::Closed));
        assert!(client.is_closed());
        assert_eq!(
            client.call(Request::Ping, None).await,
            Err(TransportError::Closed)
        );
    }
}
