//! Keeps a local replica of one document in step with its authority
//!
//! Two background loops share the replica state. The pull loop long-polls
//! for new log entries and folds them in: foreign entries are rebased past
//! local edits the authority has not confirmed yet, our own entries just
//! confirm them. The push loop sends every unconfirmed edit with the last
//! synced version as base; the authority drops the ones it already has,
//! so retries are safe. Only one push is ever in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use docsync_protocol::{
    Changeset, ClientId, Document, DocumentId, Integrated, Operation, PendingChanges,
    ProtocolError, Reply, Request, Snapshot,
};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::PeerConfig;
use crate::transport::{SyncTransport, TransportError};

/// Change the editor has to reflect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Someone else's edit, already rebased onto the local text
    Remote(Changeset),
    /// Local text was replaced wholesale after losing sync
    Reset(Snapshot),
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("document sync has been disposed")]
    Disposed,
    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug)]
struct State {
    synced_version: u64,
    document: Document,
    pending: PendingChanges,
    /// Bumped on every local edit
    local_edits: u64,
    /// `local_edits` as of the last push the authority accepted
    pushed_edits: u64,
}

impl State {
    fn from_snapshot(client_id: ClientId, snapshot: &Snapshot) -> Self {
        let document = Document::from_text(snapshot.text.clone());
        Self {
            synced_version: snapshot.version,
            pending: PendingChanges::new(client_id, document.len()),
            document,
            local_edits: 0,
            pushed_edits: 0,
        }
    }

    fn has_unpushed(&self) -> bool {
        !self.pending.is_empty() && self.local_edits != self.pushed_edits
    }

    /// Fold log entries starting at `from` into the replica
    fn integrate(
        &mut self,
        from: u64,
        entries: Vec<Changeset>,
        events: &mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<(), ProtocolError> {
        if from != self.synced_version {
            return Ok(());
        }
        for entry in entries {
            if let Integrated::Remote(changeset) = self.pending.integrate(&entry)? {
                self.document = self.document.apply(&changeset)?;
                let _ = events.send(PeerEvent::Remote(changeset));
            }
            self.synced_version += 1;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Shared<T> {
    document_id: DocumentId,
    client_id: ClientId,
    transport: T,
    config: PeerConfig,
    state: Mutex<State>,
    pushing: AtomicBool,
    push_trigger: Notify,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl<T: SyncTransport> Shared<T> {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep unless disposed first; false when disposed
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    /// Replace the replica with a fresh snapshot, retrying until it works
    async fn resync(&self, backoff: &mut Backoff) {
        loop {
            let result = tokio::select! {
                () = self.cancel.cancelled() => return,
                result = fetch_document(&self.transport, &self.document_id, self.config.request_timeout) => result,
            };
            match result {
                Ok(snapshot) => {
                    let mut state = self.state();
                    let dropped = state.pending.len();
                    if dropped > 0 {
                        tracing::warn!(
                            document_id = %self.document_id,
                            dropped,
                            "Discarding unconfirmed edits after resync"
                        );
                    }
                    state.synced_version = snapshot.version;
                    state.document = Document::from_text(snapshot.text.clone());
                    let len = state.document.len();
                    state.pending.reset(len);
                    state.pushed_edits = state.local_edits;
                    drop(state);

                    tracing::info!(
                        document_id = %self.document_id,
                        version = snapshot.version,
                        "Resynced from snapshot"
                    );
                    let _ = self.events.send(PeerEvent::Reset(snapshot));
                    backoff.reset();
                    return;
                }
                Err(e) => {
                    tracing::debug!(document_id = %self.document_id, error = %e, "Resync failed");
                    if !self.pause(backoff.next_delay()).await {
                        return;
                    }
                }
            }
        }
    }
}

async fn fetch_document<T: SyncTransport + ?Sized>(
    transport: &T,
    document_id: &str,
    timeout: Option<Duration>,
) -> Result<Snapshot, PeerError> {
    let request = Request::GetDocument {
        document_id: document_id.to_string(),
    };
    match transport.call(request, timeout).await? {
        Reply::Document(snapshot) => Ok(snapshot),
        _ => Err(PeerError::UnexpectedReply("getDocument")),
    }
}

async fn pull_loop<T: SyncTransport>(shared: Arc<Shared<T>>) {
    let mut backoff = shared.config.backoff();

    loop {
        let version = shared.state().synced_version;
        let request = Request::Pull {
            document_id: shared.document_id.clone(),
            version,
        };
        let result = tokio::select! {
            () = shared.cancel.cancelled() => break,
            result = shared.transport.call(request, None) => result,
        };
        if shared.cancel.is_cancelled() {
            break;
        }

        match result {
            Ok(Reply::Changesets { changesets }) => {
                backoff.reset();
                let count = changesets.len();
                let integrated = shared.state().integrate(version, changesets, &shared.events);
                match integrated {
                    Ok(()) => tracing::trace!(
                        document_id = %shared.document_id,
                        from = version,
                        count,
                        "Pulled entries"
                    ),
                    Err(e) => {
                        tracing::warn!(document_id = %shared.document_id, error = %e, "Lost sync while integrating");
                        shared.resync(&mut backoff).await;
                    }
                }
            }
            Err(TransportError::Remote(e @ (ProtocolError::Compacted { .. } | ProtocolError::Diverged { .. }))) => {
                tracing::info!(document_id = %shared.document_id, error = %e, "Log moved on, resyncing");
                shared.resync(&mut backoff).await;
            }
            Ok(_) => {
                tracing::warn!(document_id = %shared.document_id, "Unexpected reply to pull");
                if !shared.pause(backoff.next_delay()).await {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(document_id = %shared.document_id, error = %e, "Pull failed, backing off");
                if !shared.pause(backoff.next_delay()).await {
                    break;
                }
            }
        }
    }

    tracing::debug!(document_id = %shared.document_id, "Pull loop stopped");
}

async fn push_loop<T: SyncTransport>(shared: Arc<Shared<T>>) {
    let mut backoff = shared.config.backoff();

    loop {
        tokio::select! {
            () = shared.cancel.cancelled() => break,
            () = shared.push_trigger.notified() => {}
        }

        while shared.state().has_unpushed() {
            let (version, changesets, edits) = {
                let state = shared.state();
                (
                    state.synced_version,
                    state.pending.changesets().cloned().collect::<Vec<_>>(),
                    state.local_edits,
                )
            };
            let count = changesets.len();
            let request = Request::Push {
                document_id: shared.document_id.clone(),
                version,
                changesets,
            };

            shared.pushing.store(true, Ordering::SeqCst);
            let result = tokio::select! {
                () = shared.cancel.cancelled() => None,
                result = shared.transport.call(request, shared.config.request_timeout) => Some(result),
            };
            shared.pushing.store(false, Ordering::SeqCst);
            let Some(result) = result else {
                break;
            };

            match result {
                Ok(Reply::Accepted { version: accepted, .. }) => {
                    backoff.reset();
                    let edited_meanwhile = {
                        let mut state = shared.state();
                        state.pushed_edits = edits.max(state.pushed_edits);
                        state.local_edits != edits
                    };
                    tracing::debug!(
                        document_id = %shared.document_id,
                        from = version,
                        count,
                        version = accepted,
                        "Push accepted"
                    );
                    if edited_meanwhile && !shared.pause(shared.config.push_delay).await {
                        break;
                    }
                }
                Err(TransportError::Remote(
                    e @ (ProtocolError::RateLimited | ProtocolError::Unavailable { .. }),
                )) => {
                    tracing::debug!(document_id = %shared.document_id, error = %e, "Push deferred, backing off");
                    if !shared.pause(backoff.next_delay()).await {
                        break;
                    }
                }
                Err(TransportError::Remote(e)) => {
                    // Left for the pull loop to sort out; retried on the next edit.
                    tracing::warn!(document_id = %shared.document_id, error = %e, "Push rejected");
                    shared.state().pushed_edits = edits;
                }
                Ok(_) => {
                    tracing::warn!(document_id = %shared.document_id, "Unexpected reply to push");
                    shared.state().pushed_edits = edits;
                }
                Err(e) => {
                    tracing::debug!(document_id = %shared.document_id, error = %e, "Push failed, backing off");
                    if !shared.pause(backoff.next_delay()).await {
                        break;
                    }
                }
            }
        }
    }

    tracing::debug!(document_id = %shared.document_id, "Push loop stopped");
}

/// Sync engine for one open document
#[derive(Debug)]
pub struct PeerSync<T: SyncTransport> {
    shared: Arc<Shared<T>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: SyncTransport> PeerSync<T> {
    /// Fetch the document and start syncing it
    ///
    /// Events for the editor arrive on the returned receiver.
    pub async fn open(
        transport: T,
        document_id: impl Into<DocumentId>,
        config: PeerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        let document_id = document_id.into();
        let snapshot = fetch_document(&transport, &document_id, config.request_timeout).await?;
        let client_id = config.client_id.unwrap_or_else(ClientId::random);
        tracing::info!(
            document_id = %document_id,
            client_id = %client_id,
            version = snapshot.version,
            "Opened document"
        );

        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            document_id,
            client_id,
            transport,
            config,
            state: Mutex::new(State::from_snapshot(client_id, &snapshot)),
            pushing: AtomicBool::new(false),
            push_trigger: Notify::new(),
            cancel: CancellationToken::new(),
            events,
        });

        let tasks = vec![
            tokio::spawn(pull_loop(shared.clone())),
            tokio::spawn(push_loop(shared.clone())),
        ];
        Ok((Self { shared, tasks }, events_rx))
    }

    /// Apply operations locally and queue them for the authority
    pub fn edit(&self, operations: Vec<Operation>) -> Result<Changeset, PeerError> {
        if self.is_disposed() {
            return Err(PeerError::Disposed);
        }
        let changeset = Changeset::new(self.shared.client_id, operations);
        {
            let mut state = self.shared.state();
            let document = state.document.apply(&changeset)?;
            state.pending.push(changeset.clone())?;
            state.document = document;
            state.local_edits += 1;
        }
        self.shared.push_trigger.notify_one();
        Ok(changeset)
    }

    pub fn insert(&self, offset: usize, text: impl Into<String>) -> Result<Changeset, PeerError> {
        self.edit(vec![Operation::Insert {
            offset,
            text: text.into(),
        }])
    }

    pub fn delete(&self, offset: usize, len: usize) -> Result<Changeset, PeerError> {
        self.edit(vec![Operation::Delete { offset, len }])
    }

    pub fn document_id(&self) -> &str {
        &self.shared.document_id
    }

    pub fn client_id(&self) -> ClientId {
        self.shared.client_id
    }

    /// Local text, including unconfirmed edits
    pub fn text(&self) -> String {
        self.shared.state().document.text().to_string()
    }

    pub fn synced_version(&self) -> u64 {
        self.shared.state().synced_version
    }

    /// Local edits the authority has not confirmed yet
    pub fn unconfirmed_len(&self) -> usize {
        self.shared.state().pending.len()
    }

    pub fn is_pushing(&self) -> bool {
        self.shared.pushing.load(Ordering::SeqCst)
    }

    /// Stop both loops; replies still in flight are discarded
    pub fn dispose(&self) {
        if !self.shared.cancel.is_cancelled() {
            tracing::debug!(document_id = %self.shared.document_id, "Disposing document sync");
            self.shared.cancel.cancel();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Dispose and wait for both loops to finish
    pub async fn close(mut self) {
        self.dispose();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl<T: SyncTransport> Drop for PeerSync<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    /// Transport that answers from a script and records what was sent
    ///
    /// Pulls block until the test releases them.
    #[derive(Default)]
    struct ScriptedTransport {
        snapshot: Mutex<Snapshot>,
        pulls: Mutex<VecDeque<oneshot::Receiver<Result<Reply, TransportError>>>>,
        pushes: Mutex<Vec<Request>>,
        push_failures: AtomicUsize,
        push_rejections: Mutex<VecDeque<ProtocolError>>,
        pull_calls: AtomicUsize,
        pull_released: Notify,
    }

    impl ScriptedTransport {
        fn with_snapshot(snapshot: Snapshot) -> Arc<Self> {
            let transport = Self::default();
            *transport.snapshot.lock().unwrap() = snapshot;
            Arc::new(transport)
        }

        /// Next pull will resolve with whatever is sent on the returned slot
        fn script_pull(&self) -> oneshot::Sender<Result<Reply, TransportError>> {
            let (tx, rx) = oneshot::channel();
            self.pulls.lock().unwrap().push_back(rx);
            self.pull_released.notify_one();
            tx
        }

        fn pushes(&self) -> Vec<Request> {
            self.pushes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyncTransport for ScriptedTransport {
        async fn call(&self, request: Request, _timeout: Option<Duration>) -> Result<Reply, TransportError> {
            match request {
                Request::GetDocument { .. } => Ok(Reply::Document(self.snapshot.lock().unwrap().clone())),
                Request::Pull { .. } => {
                    self.pull_calls.fetch_add(1, Ordering::SeqCst);
                    loop {
                        let next = self.pulls.lock().unwrap().pop_front();
                        if let Some(rx) = next {
                            return rx.await.unwrap_or(Err(TransportError::Closed));
                        }
                        self.pull_released.notified().await;
                    }
                }
                Request::Push { .. } => {
                    self.pushes.lock().unwrap().push(request);
                    if self
                        .push_failures
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                    {
                        return Err(TransportError::Timeout);
                    }
                    if let Some(rejection) = self.push_rejections.lock().unwrap().pop_front() {
                        return Err(TransportError::Remote(rejection));
                    }
                    let count = self.pushes.lock().unwrap().len() as u64;
                    Ok(Reply::Accepted {
                        accepted: true,
                        version: count,
                    })
                }
                Request::Ping => Ok(Reply::Pong),
            }
        }
    }

    fn config(client: u64) -> PeerConfig {
        PeerConfig {
            client_id: Some(ClientId(client)),
            push_delay: Duration::from_millis(5),
            request_timeout: Some(Duration::from_secs(1)),
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(10),
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition reached in time");
    }

    #[tokio::test]
    async fn open_starts_from_snapshot() {
        let transport = ScriptedTransport::with_snapshot(Snapshot::new(3, "abc"));
        let (peer, _events) = PeerSync::open(transport, "doc", config(1)).await.unwrap();
        assert_eq!(peer.text(), "abc");
        assert_eq!(peer.synced_version(), 3);
        assert_eq!(peer.client_id(), ClientId(1));
    }

    #[tokio::test]
    async fn local_edit_is_pushed_from_synced_version() {
        let transport = ScriptedTransport::with_snapshot(Snapshot::new(2, "ab"));
        let (peer, _events) = PeerSync::open(transport.clone(), "doc", config(1)).await.unwrap();

        let edit = peer.insert(2, "c").unwrap();
        assert_eq!(peer.text(), "abc");
        eventually(|| transport.pushes().len() == 1).await;

        assert_eq!(
            transport.pushes()[0],
            Request::Push {
                document_id: "doc".into(),
                version: 2,
                changesets: vec![edit],
            }
        );
        // Still unconfirmed until it comes back through a pull.
        assert_eq!(peer.unconfirmed_len(), 1);
    }

    #[tokio::test]
    async fn invalid_edit_changes_nothing() {
        let transport = ScriptedTransport::with_snapshot(Snapshot::new(0, "ab"));
        let (peer, _events) = PeerSync::open(transport, "doc", config(1)).await.unwrap();

        assert!(matches!(
            peer.delete(1, 5),
            Err(PeerError::Protocol(ProtocolError::OutOfBounds { .. }))
        ));
        assert_eq!(peer.text(), "ab");
        assert_eq!(peer.unconfirmed_len(), 0);
    }

    #[tokio::test]
    async fn pulled_entries_rebase_past_local_edits() {
        let transport = ScriptedTransport::with_snapshot(Snapshot::new(0, ""));
        let (peer, mut events) = PeerSync::open(transport.clone(), "doc", config(2)).await.unwrap();

        let mine = peer.insert(0, "B").unwrap();
        let pull = transport.script_pull();
        let theirs = Changeset::insert(ClientId(1), 0, "A");
        pull.send(Ok(Reply::Changesets {
            changesets: vec![theirs.clone(), Changeset::insert(ClientId(2), 1, "B")],
        }))
        .unwrap();

        assert_eq!(events.recv().await, Some(PeerEvent::Remote(theirs)));
        eventually(|| peer.synced_version() == 2).await;
        assert_eq!(peer.text(), "AB");
        assert_eq!(peer.unconfirmed_len(), 0);
        let _ = mine;
    }

    #[tokio::test]
    async fn failed_push_is_retried_with_backoff() {
        let transport = ScriptedTransport::with_snapshot(Snapshot::new(0, ""));
        transport.push_failures.store(2, Ordering::SeqCst);
        let (peer, _events) = PeerSync::open(transport.clone(), "doc", config(1)).await.unwrap();

        peer.insert(0, "x").unwrap();
        eventually(|| transport.pushes().len() == 3).await;
        assert!(transport.pushes().iter().all(|p| p == &transport.pushes()[0]));

        // Accepted now; no more pushes without new edits.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.pushes().len(), 3);
    }

    #[tokio::test]
    async fn transient_rejections_are_retried_without_new_edits() {
        let transport = ScriptedTransport::with_snapshot(Snapshot::new(0, ""));
        transport.push_rejections.lock().unwrap().extend([
            ProtocolError::RateLimited,
            ProtocolError::Unavailable {
                document_id: "doc".into(),
            },
        ]);
        let (peer, _events) = PeerSync::open(transport.clone(), "doc", config(1)).await.unwrap();

        peer.insert(0, "x").unwrap();
        eventually(|| transport.pushes().len() == 3).await;
        assert!(transport.pushes().iter().all(|p| p == &transport.pushes()[0]));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.pushes().len(), 3);
    }

    #[tokio::test]
    async fn permanent_rejection_waits_for_next_edit() {
        let transport = ScriptedTransport::with_snapshot(Snapshot::new(0, ""));
        transport
            .push_rejections
            .lock()
            .unwrap()
            .push_back(ProtocolError::malformed("bad base"));
        let (peer, _events) = PeerSync::open(transport.clone(), "doc", config(1)).await.unwrap();

        peer.insert(0, "x").unwrap();
        eventually(|| transport.pushes().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.pushes().len(), 1);

        peer.insert(1, "y").unwrap();
        eventually(|| transport.pushes().len() == 2).await;
    }

    #[tokio::test]
    async fn edits_during_push_go_out_together() {
        let transport = ScriptedTransport::with_snapshot(Snapshot::new(0, ""));
        let (peer, _events) = PeerSync::open(transport.clone(), "doc", config(1)).await.unwrap();

        peer.insert(0, "a").unwrap();
        peer.insert(1, "b").unwrap();
        peer.insert(2, "c").unwrap();
        eventually(|| !peer.is_pushing() && !transport.pushes().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let last = transport.pushes().pop().unwrap();
        let Request::Push { changesets, .. } = last else {
            panic!("expected a push");
        };
        assert_eq!(changesets.len(), 3);
    }

    #[tokio::test]
    async fn compacted_pull_resets_replica() {
        let transport = ScriptedTransport::with_snapshot(Snapshot::new(0, "old"));
        let (peer, mut events) = PeerSync::open(transport.clone(), "doc", config(1)).await.unwrap();
        peer.insert(0, "lost ").unwrap();

        *transport.snapshot.lock().unwrap() = Snapshot::new(9, "fresh");
        transport
            .script_pull()
            .send(Err(TransportError::Remote(ProtocolError::Compacted {
                requested: 0,
                base_version: 9,
            })))
            .unwrap();

        assert_eq!(
            events.recv().await,
            Some(PeerEvent::Reset(Snapshot::new(9, "fresh")))
        );
        assert_eq!(peer.text(), "fresh");
        assert_eq!(peer.synced_version(), 9);
        assert_eq!(peer.unconfirmed_len(), 0);
    }

    #[tokio::test]
    async fn reply_after_dispose_is_discarded() {
        let transport = ScriptedTransport::with_snapshot(Snapshot::new(0, ""));
        let (peer, mut events) = PeerSync::open(transport.clone(), "doc", config(1)).await.unwrap();
        eventually(|| transport.pull_calls.load(Ordering::SeqCst) == 1).await;

        peer.dispose();
        assert!(peer.is_disposed());
        assert!(matches!(peer.insert(0, "x"), Err(PeerError::Disposed)));

        let pull = transport.script_pull();
        let _ = pull.send(Ok(Reply::Changesets {
            changesets: vec![Changeset::insert(ClientId(7), 0, "late")],
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(peer.text(), "");
        assert_eq!(peer.synced_version(), 0);
        assert_eq!(transport.pull_calls.load(Ordering::SeqCst), 1);
        assert!(events.try_recv().is_err());
        peer.close().await;
    }
}
