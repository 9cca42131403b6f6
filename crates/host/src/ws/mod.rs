//! WebSocket transport for the router
//!
//! ## Module Structure
//! - `connection`: handshake, request loop, heartbeat
//! - `rate_limit`: per-connection token bucket

mod connection;
mod rate_limit;

pub use connection::handle_connection;
pub use rate_limit::RateLimiter;

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::router::Router;

/// Accept connections on `listener` until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    router: Arc<Router>,
    config: ConnectionConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "WebSocket server listening");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let router = router.clone();
                    let config = config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, router, config).await {
                            tracing::warn!(peer = %addr, error = %e, "Connection error");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Accept failed");
                }
            },
        }
    }

    tracing::info!("WebSocket server stopped");
    Ok(())
}
