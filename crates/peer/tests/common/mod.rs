//! Shared helpers for peer integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use docsync_host::config::AuthorityConfig;
use docsync_host::{AuthorityRegistry, Router};
use docsync_peer::{PeerConfig, PeerSync, RpcClient, SyncTransport};
use docsync_protocol::ClientId;

pub fn router() -> Arc<Router> {
    Arc::new(Router::new(AuthorityRegistry::shared(
        AuthorityConfig::default(),
    )))
}

/// Transport over an in-process router connection
pub fn local_client(router: &Arc<Router>) -> RpcClient {
    let connection = router.connect_local();
    RpcClient::new(connection.requests, connection.replies)
}

pub fn config(client: u64) -> PeerConfig {
    PeerConfig {
        client_id: Some(ClientId(client)),
        push_delay: Duration::from_millis(5),
        request_timeout: Some(Duration::from_secs(2)),
        backoff_initial: Duration::from_millis(5),
        backoff_max: Duration::from_millis(50),
    }
}

/// Wait until every peer has the same text and nothing left to confirm
pub async fn settle<T: SyncTransport>(peers: &[&PeerSync<T>]) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let first = peers[0].text();
            let done = peers
                .iter()
                .all(|p| p.unconfirmed_len() == 0 && p.text() == first)
                && peers
                    .windows(2)
                    .all(|w| w[0].synced_version() == w[1].synced_version());
            if done {
                return first;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("peers converged in time")
}
