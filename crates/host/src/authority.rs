//! Synchronization authority for a single document
//!
//! [`Authority`] owns the canonical update log: it accepts pushes
//! (rebasing them past entries the sender had not seen) and answers pulls,
//! parking them as waiters when there is nothing new yet. It is plain
//! synchronous state; [`spawn`] runs one inside its own task so that all
//! calls for a document are serialized without a global lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use docsync_protocol::{Changeset, Document, DocumentId, PendingChanges, ProtocolError, Snapshot};
use tokio::sync::{mpsc, oneshot};

use crate::error::SyncError;

/// Completion side of a pull request
pub type PullReply = oneshot::Sender<Result<Vec<Changeset>, ProtocolError>>;

/// Receiving side of a pull request
pub type PullWaiter = oneshot::Receiver<Result<Vec<Changeset>, ProtocolError>>;

#[derive(Debug, Clone)]
struct LogEntry {
    changeset: Changeset,
    /// Document length the changeset applies to
    base_len: usize,
}

/// Update log and pending pulls for one document
#[derive(Debug)]
pub struct Authority {
    document_id: DocumentId,
    /// Version of the first retained entry (non-zero after compaction)
    base_version: u64,
    log: Vec<LogEntry>,
    document: Document,
    waiters: Vec<PullReply>,
    last_activity: Instant,
}

impl Authority {
    pub fn new(document_id: impl Into<DocumentId>) -> Self {
        Self::from_snapshot(document_id, Snapshot::default())
    }

    /// Resume from a compacted snapshot
    ///
    /// Requests based on versions older than the snapshot fail with
    /// `Compacted`.
    pub fn from_snapshot(document_id: impl Into<DocumentId>, snapshot: Snapshot) -> Self {
        Self {
            document_id: document_id.into(),
            base_version: snapshot.version,
            log: Vec::new(),
            document: Document::from_text(snapshot.text),
            waiters: Vec::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Current version (number of accepted changesets)
    pub fn version(&self) -> u64 {
        self.base_version + self.log.len() as u64
    }

    pub const fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn text(&self) -> &str {
        self.document.text()
    }

    /// Current version and text
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.version(), self.document.text())
    }

    /// Waiters whose requester is still listening
    pub fn live_waiters(&mut self) -> usize {
        self.waiters.retain(|w| !w.is_closed());
        self.waiters.len()
    }

    /// No live waiters and no requests for at least `idle_for`
    pub fn is_idle(&mut self, idle_for: Duration) -> bool {
        self.live_waiters() == 0 && self.last_activity.elapsed() >= idle_for
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn index(&self, version: u64) -> Result<usize, ProtocolError> {
        if version < self.base_version {
            return Err(ProtocolError::Compacted {
                requested: version,
                base_version: self.base_version,
            });
        }
        usize::try_from(version - self.base_version)
            .map_err(|_| ProtocolError::malformed(format!("version {version} out of range")))
    }

    /// Document length at `version`
    fn len_at(&self, version: u64) -> Result<usize, SyncError> {
        let idx = self.index(version)?;
        if idx == self.log.len() {
            return Ok(self.document.len());
        }
        self.log.get(idx).map(|e| e.base_len).ok_or_else(|| {
            SyncError::Invariant(format!(
                "{}: no log entry for version {version}",
                self.document_id
            ))
        })
    }

    /// Answer now if the log has moved past `from`, otherwise park `reply`
    pub fn pull(&mut self, from: u64, reply: PullReply) {
        self.touch();
        let current = self.version();

        if from < current {
            let result = self
                .index(from)
                .map(|idx| self.log[idx..].iter().map(|e| e.changeset.clone()).collect());
            let _ = reply.send(result);
            return;
        }

        if from > current {
            tracing::warn!(
                document_id = %self.document_id,
                requested = from,
                version = current,
                "Pull from beyond the log, waiting for the next push"
            );
        }
        self.waiters.retain(|w| !w.is_closed());
        self.waiters.push(reply);
    }

    /// Accept changesets made on top of `from`, returning the new version
    ///
    /// Entries already in the log from the same client are recognized and
    /// not appended twice. Nothing is mutated unless the whole push
    /// applies.
    pub fn push(&mut self, from: u64, changesets: Vec<Changeset>) -> Result<u64, SyncError> {
        self.touch();
        let current = self.version();

        let Some(origin) = changesets.first().map(|cs| cs.origin_client_id) else {
            return Ok(current);
        };
        if changesets.iter().any(|cs| cs.origin_client_id != origin) {
            return Err(ProtocolError::malformed("push mixes changesets from several clients").into());
        }
        if from > current {
            return Err(ProtocolError::malformed(format!(
                "push based on version {from}, log is at {current}"
            ))
            .into());
        }

        let start = self.index(from)?;
        let mut pending = PendingChanges::new(origin, self.len_at(from)?);
        for changeset in changesets {
            pending.push(changeset)?;
        }
        for entry in &self.log[start..] {
            pending.integrate(&entry.changeset)?;
        }
        if pending.base_len() != self.document.len() {
            return Err(SyncError::Invariant(format!(
                "{}: rebased length {} does not match document length {}",
                self.document_id,
                pending.base_len(),
                self.document.len()
            )));
        }

        let mut document = self.document.clone();
        let mut appended = Vec::with_capacity(pending.len());
        for changeset in pending.into_changesets() {
            let base_len = document.len();
            document = document.apply(&changeset)?;
            appended.push(LogEntry {
                changeset,
                base_len,
            });
        }

        if appended.is_empty() {
            tracing::debug!(
                document_id = %self.document_id,
                client_id = %origin,
                version = current,
                "Push already in the log"
            );
            return Ok(current);
        }

        let fresh: Vec<Changeset> = appended.iter().map(|e| e.changeset.clone()).collect();
        self.log.extend(appended);
        self.document = document;
        let version = self.version();

        let waiters = std::mem::take(&mut self.waiters);
        let woken = waiters
            .into_iter()
            .filter_map(|w| w.send(Ok(fresh.clone())).ok())
            .count();

        tracing::debug!(
            document_id = %self.document_id,
            client_id = %origin,
            from,
            appended = fresh.len(),
            version,
            woken,
            "Push accepted"
        );
        Ok(version)
    }
}

#[derive(Debug)]
enum Command {
    Pull {
        from: u64,
        reply: PullReply,
    },
    Push {
        from: u64,
        changesets: Vec<Changeset>,
        reply: oneshot::Sender<Result<u64, ProtocolError>>,
    },
    GetDocument {
        reply: oneshot::Sender<Snapshot>,
    },
    Evict {
        idle_for: Duration,
        reply: oneshot::Sender<Option<Snapshot>>,
    },
}

/// Mailbox of a running authority
#[derive(Debug, Clone)]
pub struct AuthorityHandle {
    document_id: Arc<str>,
    tx: mpsc::Sender<Command>,
}

/// Run `authority` in its own task
pub fn spawn(authority: Authority, mailbox: usize) -> AuthorityHandle {
    let (tx, rx) = mpsc::channel(mailbox.max(1));
    let handle = AuthorityHandle {
        document_id: authority.document_id().into(),
        tx,
    };
    tokio::spawn(run(authority, rx));
    handle
}

/// Handle whose mailbox is never drained until `release` fires
#[cfg(test)]
pub(crate) fn stalled(document_id: &str, mailbox: usize) -> (AuthorityHandle, tokio_util::sync::CancellationToken) {
    let (tx, rx) = mpsc::channel(mailbox.max(1));
    let release = tokio_util::sync::CancellationToken::new();
    let held = release.clone();
    tokio::spawn(async move {
        held.cancelled().await;
        drop(rx);
    });
    let handle = AuthorityHandle {
        document_id: document_id.into(),
        tx,
    };
    (handle, release)
}

async fn run(mut authority: Authority, mut rx: mpsc::Receiver<Command>) {
    tracing::debug!(
        document_id = %authority.document_id(),
        version = authority.version(),
        "Authority started"
    );

    while let Some(command) = rx.recv().await {
        match command {
            Command::Pull { from, reply } => authority.pull(from, reply),
            Command::Push {
                from,
                changesets,
                reply,
            } => match authority.push(from, changesets) {
                Ok(version) => {
                    let _ = reply.send(Ok(version));
                }
                Err(SyncError::Protocol(e)) => {
                    tracing::warn!(document_id = %authority.document_id(), error = %e, "Push rejected");
                    let _ = reply.send(Err(e));
                }
                Err(e) => {
                    tracing::error!(
                        document_id = %authority.document_id(),
                        error = %e,
                        "Authority failed, stopping"
                    );
                    let _ = reply.send(Err(e.into_protocol(authority.document_id())));
                    break;
                }
            },
            Command::GetDocument { reply } => {
                authority.touch();
                let _ = reply.send(authority.snapshot());
            }
            Command::Evict { idle_for, reply } => {
                if authority.is_idle(idle_for) {
                    let _ = reply.send(Some(authority.snapshot()));
                    break;
                }
                let _ = reply.send(None);
            }
        }
    }

    tracing::debug!(document_id = %authority.document_id(), "Authority stopped");
}

impl AuthorityHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Both handles address the same running authority
    pub fn same_authority(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }

    fn gone(&self) -> SyncError {
        SyncError::AuthorityGone {
            document_id: self.document_id.to_string(),
        }
    }

    async fn send(&self, command: Command) -> Result<(), SyncError> {
        self.tx.send(command).await.map_err(|_| self.gone())
    }

    /// Register a pull; the returned waiter resolves when entries exist
    pub async fn pull(&self, from: u64) -> Result<PullWaiter, SyncError> {
        let (reply, waiter) = oneshot::channel();
        self.send(Command::Pull { from, reply }).await?;
        Ok(waiter)
    }

    pub async fn push(&self, from: u64, changesets: Vec<Changeset>) -> Result<u64, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Push {
            from,
            changesets,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| self.gone())??)
    }

    pub async fn get_document(&self) -> Result<Snapshot, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetDocument { reply }).await?;
        rx.await.map_err(|_| self.gone())
    }

    /// Stop the authority if it has been idle for `idle_for`
    ///
    /// Returns the final snapshot when it stopped.
    pub async fn try_evict(&self, idle_for: Duration) -> Result<Option<Snapshot>, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Evict { idle_for, reply }).await?;
        rx.await.map_err(|_| self.gone())
    }
}
