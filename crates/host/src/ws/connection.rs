//! One WebSocket connection: handshake, request loop, heartbeat

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use anyhow::Result;
use docsync_protocol::{ProtocolError, ReplyFrame, RequestFrame, WireFormat};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;

use super::rate_limit::RateLimiter;
use crate::config::ConnectionConfig;
use crate::router::Router;

/// Frame a reply in the connection's format
fn encode_reply(format: WireFormat, frame: &ReplyFrame) -> Result<Message, ProtocolError> {
    let bytes = format.encode(frame)?;
    match format {
        WireFormat::MessagePack => Ok(Message::Binary(bytes)),
        WireFormat::Json => String::from_utf8(bytes)
            .map(Message::Text)
            .map_err(|e| ProtocolError::malformed(e.to_string())),
    }
}

/// Serve requests on `stream` until the peer leaves or goes silent
///
/// The first data frame fixes the reply format: binary frames get
/// MessagePack replies, text frames get JSON.
pub async fn handle_connection<S>(
    stream: S,
    router: Arc<Router>,
    config: ConnectionConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (ws_tx, mut ws_rx) = ws.split();
    let ws_tx = Arc::new(Mutex::new(ws_tx));

    let (connection_id, mut replies) = router.connect();
    tracing::info!(connection_id, "Peer connected");

    let format = Arc::new(OnceLock::<WireFormat>::new());

    let sender_tx = ws_tx.clone();
    let sender_format = format.clone();
    let sender = tokio::spawn(async move {
        while let Some(frame) = replies.recv().await {
            let format = sender_format.get().copied().unwrap_or_default();
            let message = match encode_reply(format, &frame) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(connection_id, request_id = frame.id, error = %e, "Reply encode failed");
                    continue;
                }
            };
            if sender_tx.lock().await.send(message).await.is_err() {
                tracing::warn!(connection_id, "Send failed, stopping sender");
                break;
            }
        }
    });

    let mut rate_limiter = RateLimiter::new(config.rate_burst, config.rate_per_sec);
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval());
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if last_activity.elapsed() > config.heartbeat_timeout() {
                    tracing::warn!(
                        connection_id,
                        idle_secs = last_activity.elapsed().as_secs(),
                        "Heartbeat timeout, closing connection"
                    );
                    break;
                }
                if ws_tx.lock().await.send(Message::Ping(Vec::new())).await.is_err() {
                    tracing::debug!(connection_id, "Ping send failed");
                    break;
                }
            }

            msg = ws_rx.next() => {
                let (frame_format, data) = match msg {
                    Some(Ok(Message::Binary(data))) => (WireFormat::MessagePack, data),
                    Some(Ok(Message::Text(text))) => (WireFormat::Json, text.into_bytes()),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_activity = Instant::now();
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(connection_id, error = %e, "WebSocket read failed");
                        break;
                    }
                };
                last_activity = Instant::now();
                let _ = format.set(frame_format);

                let frame: RequestFrame = match frame_format.decode(&data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(connection_id, error = %e, "Dropping undecodable frame");
                        continue;
                    }
                };

                if !rate_limiter.try_consume() {
                    tracing::warn!(connection_id, request_id = frame.id, "Rate limited");
                    router.reply(connection_id, ReplyFrame::err(frame.id, ProtocolError::RateLimited));
                    continue;
                }

                router.handle(connection_id, frame).await;
            }
        }
    }

    router.disconnect(connection_id);
    sender.abort();
    let _ = ws_tx.lock().await.close().await;
    tracing::info!(connection_id, "Peer disconnected");
    Ok(())
}
