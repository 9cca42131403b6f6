use std::time::Duration;

use docsync_protocol::ClientId;

use crate::backoff::Backoff;

/// Tuning for one [`PeerSync`](crate::PeerSync)
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Fixed id for this participant; random when `None`
    pub client_id: Option<ClientId>,
    /// Wait before re-pushing edits made while a push was in flight
    pub push_delay: Duration,
    /// Limit for push and snapshot requests; pulls wait indefinitely
    pub request_timeout: Option<Duration>,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            push_delay: Duration::from_millis(100),
            request_timeout: Some(Duration::from_secs(10)),
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl PeerConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_initial, self.backoff_max)
    }
}
