//! Lazily created authorities, one per document id
//!
//! Idle authorities are stopped by a periodic sweep and replaced by their
//! final snapshot; the next request for that document resumes from it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use docsync_protocol::{DocumentId, Snapshot};
use futures::future::join_all;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::authority::{self, Authority, AuthorityHandle};
use crate::config::AuthorityConfig;

#[derive(Debug, Default)]
struct Inner {
    authorities: HashMap<DocumentId, AuthorityHandle>,
    snapshots: HashMap<DocumentId, Snapshot>,
    /// Documents with an eviction request in flight
    evicting: HashSet<DocumentId>,
}

impl Inner {
    fn keep_newest(&mut self, document_id: &str, snapshot: Snapshot) {
        match self.snapshots.get_mut(document_id) {
            Some(existing) if existing.version >= snapshot.version => {}
            Some(existing) => *existing = snapshot,
            None => {
                self.snapshots.insert(document_id.to_string(), snapshot);
            }
        }
    }
}

#[derive(Debug)]
pub struct AuthorityRegistry {
    inner: Mutex<Inner>,
    /// Woken whenever an eviction settles
    settled: Notify,
    config: AuthorityConfig,
}

/// Shared registry handle
pub type SharedRegistry = Arc<AuthorityRegistry>;

impl AuthorityRegistry {
    pub fn new(config: AuthorityConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            settled: Notify::new(),
            config,
        }
    }

    pub fn shared(config: AuthorityConfig) -> SharedRegistry {
        Arc::new(Self::new(config))
    }

    /// Running authority for `document_id`, started on first use
    ///
    /// A stopped authority whose eviction is still settling is only
    /// restarted once its snapshot has been recorded.
    pub async fn get_or_create(&self, document_id: &str) -> AuthorityHandle {
        loop {
            let settled = self.settled.notified();
            let mut inner = self.inner.lock().await;
            if let Some(handle) = inner.authorities.get(document_id) {
                if !handle.is_closed() {
                    return handle.clone();
                }
            }
            if !inner.evicting.contains(document_id) {
                return self.start(&mut inner, document_id);
            }
            drop(inner);
            settled.await;
        }
    }

    /// Swap out an authority whose mailbox is gone
    ///
    /// If another caller already replaced it, the newer handle is returned.
    pub async fn replace_failed(&self, failed: &AuthorityHandle) -> AuthorityHandle {
        let document_id = failed.document_id();
        loop {
            let settled = self.settled.notified();
            let mut inner = self.inner.lock().await;
            let replaced = inner
                .authorities
                .get(document_id)
                .filter(|current| !current.same_authority(failed) && !current.is_closed())
                .cloned();
            if let Some(current) = replaced {
                return current;
            }
            if !inner.evicting.contains(document_id) {
                tracing::warn!(document_id, "Restarting stopped authority");
                return self.start(&mut inner, document_id);
            }
            drop(inner);
            settled.await;
        }
    }

    fn start(&self, inner: &mut Inner, document_id: &str) -> AuthorityHandle {
        let authority = match inner.snapshots.get(document_id) {
            Some(snapshot) => {
                tracing::info!(
                    document_id,
                    version = snapshot.version,
                    "Restoring authority from snapshot"
                );
                Authority::from_snapshot(document_id, snapshot.clone())
            }
            None => {
                tracing::info!(document_id, "Creating authority");
                Authority::new(document_id)
            }
        };
        let handle = authority::spawn(authority, self.config.mailbox_capacity);
        inner
            .authorities
            .insert(document_id.to_string(), handle.clone());
        handle
    }

    /// Remember the newest snapshot seen for a document
    pub async fn record_snapshot(&self, document_id: &str, snapshot: Snapshot) {
        self.inner.lock().await.keep_newest(document_id, snapshot);
    }

    pub async fn snapshot(&self, document_id: &str) -> Option<Snapshot> {
        self.inner.lock().await.snapshots.get(document_id).cloned()
    }

    /// Stop every authority idle past the configured timeout
    ///
    /// The registry lock is only held to pick candidates and to record each
    /// outcome; the eviction requests themselves run concurrently without it.
    /// Returns the ids that were stopped.
    pub async fn evict_idle(&self) -> Vec<DocumentId> {
        let Some(idle_for) = self.config.idle_timeout() else {
            return Vec::new();
        };

        let candidates: Vec<(DocumentId, AuthorityHandle)> = {
            let mut inner = self.inner.lock().await;
            let candidates: Vec<_> = inner
                .authorities
                .iter()
                .filter(|(id, _)| !inner.evicting.contains(*id))
                .map(|(id, handle)| (id.clone(), handle.clone()))
                .collect();
            inner
                .evicting
                .extend(candidates.iter().map(|(id, _)| id.clone()));
            candidates
        };

        let outcomes = join_all(
            candidates
                .into_iter()
                .map(|(document_id, handle)| self.evict_one(document_id, handle, idle_for)),
        )
        .await;
        outcomes.into_iter().flatten().collect()
    }

    async fn evict_one(
        &self,
        document_id: DocumentId,
        handle: AuthorityHandle,
        idle_for: Duration,
    ) -> Option<DocumentId> {
        let outcome = handle.try_evict(idle_for).await;

        let mut inner = self.inner.lock().await;
        inner.evicting.remove(&document_id);
        let current = inner
            .authorities
            .get(&document_id)
            .is_some_and(|running| running.same_authority(&handle));
        let evicted = match outcome {
            Ok(Some(snapshot)) => {
                tracing::debug!(
                    document_id = %document_id,
                    version = snapshot.version,
                    "Authority evicted"
                );
                if current {
                    inner.authorities.remove(&document_id);
                }
                inner.keep_newest(&document_id, snapshot);
                true
            }
            Ok(None) => false,
            Err(_) => {
                if current {
                    inner.authorities.remove(&document_id);
                }
                current
            }
        };
        drop(inner);
        self.settled.notify_waiters();

        evicted.then_some(document_id)
    }

    /// Number of running authorities
    pub async fn len(&self) -> usize {
        self.inner.lock().await.authorities.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Periodically evict idle authorities until `shutdown` fires
    ///
    /// Returns `None` when eviction is disabled.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        self.config.idle_timeout()?;
        let registry = Arc::clone(self);
        let every = self.config.sweep_interval();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.evict_idle().await;
                        if !evicted.is_empty() {
                            tracing::info!(count = evicted.len(), "Evicted idle authorities");
                        }
                    }
                }
            }
        }))
    }
}
