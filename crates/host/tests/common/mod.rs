//! Common test utilities
#![allow(dead_code)] // Not every helper is used by every test file

use std::net::SocketAddr;
use std::sync::Arc;

use docsync_host::config::{AuthorityConfig, ConnectionConfig};
use docsync_host::{ws, AuthorityRegistry, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Host serving on an ephemeral local port
pub struct TestHost {
    pub addr: SocketAddr,
    pub router: Arc<Router>,
    pub shutdown: CancellationToken,
}

impl TestHost {
    pub async fn start(connection: ConnectionConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = AuthorityRegistry::shared(AuthorityConfig::default());
        let router = Arc::new(Router::new(registry));
        let shutdown = CancellationToken::new();

        tokio::spawn(ws::serve(
            listener,
            router.clone(),
            connection,
            shutdown.clone(),
        ));

        Self {
            addr,
            router,
            shutdown,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }
}

impl Drop for TestHost {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
