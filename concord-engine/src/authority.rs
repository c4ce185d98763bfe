//! The per-document authority: the only writer of a document's state.
//!
//! Each live document is owned by exactly one authority task with an
//! mpsc mailbox. Requests are processed strictly in receipt order, which
//! is the load-bearing invariant of the whole engine: the rebase-against-
//! history algorithm assumes a linear, already-agreed-upon history, and
//! any interleaving of `submit` calls for one document would break
//! convergence. Different documents run on independent tasks and never
//! contend.
//!
//! Lifecycle: `Unloaded → Loading → Ready → Unloaded`. The task starts
//! unloaded and loads lazily on the first request (latest snapshot, then
//! contiguous log replay); because the task is serial, every request
//! queued behind the first shares that single in-flight load. When the
//! last client leaves, the authority flushes a final snapshot and the
//! task exits; the registry replaces dead handles, so a join racing an
//! unload re-enters `Ready` through a fresh load that observes the
//! flushed snapshot (or, failing that, the log — which is always
//! sufficient).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::broadcast::{DocEvent, DocumentChannel};
use crate::error::EngineError;
use crate::presence::{ClientSession, PresenceDirectory, PresenceEvent, Selection};
use crate::registry::EngineConfig;
use crate::storage::{
    OperationLog, OperationRecord, Snapshot, SnapshotStore, StoreError,
};
use concord_ot::{transform, transform_cursor, Operation};

/// Bootstrap state for a newly joined client.
#[derive(Debug, Clone, PartialEq)]
pub struct InitState {
    pub version: u64,
    pub content: String,
    pub clients: Vec<ClientSession>,
}

/// The result of a successful submission. `operation` is the rebased
/// form — the caller broadcasts *this*, never the original.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub version: u64,
    pub operation: Operation,
}

/// Mailbox messages. Every request carries a oneshot reply.
pub(crate) enum AuthorityRequest {
    Join {
        session: ClientSession,
        reply: oneshot::Sender<Result<InitState, EngineError>>,
    },
    Leave {
        client_id: Uuid,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Submit {
        client_id: Uuid,
        user_id: Uuid,
        client_version: u64,
        operation: Operation,
        reply: oneshot::Sender<Result<Commit, EngineError>>,
    },
    UpdateCursor {
        client_id: Uuid,
        cursor: usize,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    UpdateSelection {
        client_id: Uuid,
        selection: Option<Selection>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    State {
        reply: oneshot::Sender<Result<InitState, EngineError>>,
    },
}

/// The authority's send side, as held by the registry.
#[derive(Clone)]
pub(crate) struct AuthorityHandle {
    tx: mpsc::Sender<AuthorityRequest>,
    channel: Arc<DocumentChannel>,
}

/// The authority task has exited (document unloaded). The registry
/// replaces the handle and retries.
pub(crate) struct ActorGone;

impl AuthorityHandle {
    pub(crate) fn spawn<L, S, P>(
        doc_id: Uuid,
        config: EngineConfig,
        log: Arc<L>,
        snapshots: Arc<S>,
        presence: Arc<P>,
    ) -> Self
    where
        L: OperationLog,
        S: SnapshotStore,
        P: PresenceDirectory,
    {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity);
        let channel = Arc::new(DocumentChannel::new(config.broadcast_capacity));
        let authority = DocumentAuthority {
            doc_id,
            config,
            log,
            snapshots,
            presence,
            channel: Arc::clone(&channel),
            state: None,
        };
        tokio::spawn(authority.run(rx));
        Self { tx, channel }
    }

    pub(crate) async fn join(
        &self,
        session: ClientSession,
    ) -> Result<Result<InitState, EngineError>, ActorGone> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AuthorityRequest::Join { session, reply })
            .await
            .map_err(|_| ActorGone)?;
        rx.await.map_err(|_| ActorGone)
    }

    pub(crate) async fn leave(
        &self,
        client_id: Uuid,
    ) -> Result<Result<usize, EngineError>, ActorGone> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AuthorityRequest::Leave { client_id, reply })
            .await
            .map_err(|_| ActorGone)?;
        rx.await.map_err(|_| ActorGone)
    }

    pub(crate) async fn submit(
        &self,
        client_id: Uuid,
        user_id: Uuid,
        client_version: u64,
        operation: Operation,
    ) -> Result<Result<Commit, EngineError>, ActorGone> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AuthorityRequest::Submit {
                client_id,
                user_id,
                client_version,
                operation,
                reply,
            })
            .await
            .map_err(|_| ActorGone)?;
        rx.await.map_err(|_| ActorGone)
    }

    pub(crate) async fn update_cursor(
        &self,
        client_id: Uuid,
        cursor: usize,
    ) -> Result<Result<(), EngineError>, ActorGone> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AuthorityRequest::UpdateCursor { client_id, cursor, reply })
            .await
            .map_err(|_| ActorGone)?;
        rx.await.map_err(|_| ActorGone)
    }

    pub(crate) async fn update_selection(
        &self,
        client_id: Uuid,
        selection: Option<Selection>,
    ) -> Result<Result<(), EngineError>, ActorGone> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AuthorityRequest::UpdateSelection {
                client_id,
                selection,
                reply,
            })
            .await
            .map_err(|_| ActorGone)?;
        rx.await.map_err(|_| ActorGone)
    }

    pub(crate) async fn state(&self) -> Result<Result<InitState, EngineError>, ActorGone> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AuthorityRequest::State { reply })
            .await
            .map_err(|_| ActorGone)?;
        rx.await.map_err(|_| ActorGone)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DocEvent> {
        self.channel.subscribe()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Live document state. Exists only between load and unload.
struct DocState {
    version: u64,
    content: String,
    /// Write-through read cache of the presence directory.
    clients: HashMap<Uuid, ClientSession>,
}

struct DocumentAuthority<L, S, P> {
    doc_id: Uuid,
    config: EngineConfig,
    log: Arc<L>,
    snapshots: Arc<S>,
    presence: Arc<P>,
    channel: Arc<DocumentChannel>,
    /// `None` means unloaded; populated lazily on first request.
    state: Option<DocState>,
}

/// Milliseconds since the Unix epoch.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl<L, S, P> DocumentAuthority<L, S, P>
where
    L: OperationLog,
    S: SnapshotStore,
    P: PresenceDirectory,
{
    async fn run(mut self, mut rx: mpsc::Receiver<AuthorityRequest>) {
        while let Some(request) = rx.recv().await {
            match request {
                AuthorityRequest::Join { session, reply } => {
                    let _ = reply.send(self.handle_join(session).await);
                }
                AuthorityRequest::Leave { client_id, reply } => {
                    let result = self.handle_leave(client_id).await;
                    let unload = matches!(result, Ok(0));
                    if unload {
                        self.flush_final_snapshot().await;
                    }
                    let _ = reply.send(result);
                    if unload {
                        log::info!("document {} unloaded (last client left)", self.doc_id);
                        break;
                    }
                }
                AuthorityRequest::Submit {
                    client_id,
                    user_id,
                    client_version,
                    operation,
                    reply,
                } => {
                    let _ = reply.send(
                        self.handle_submit(client_id, user_id, client_version, operation)
                            .await,
                    );
                }
                AuthorityRequest::UpdateCursor { client_id, cursor, reply } => {
                    let _ = reply.send(self.handle_update_cursor(client_id, cursor).await);
                }
                AuthorityRequest::UpdateSelection {
                    client_id,
                    selection,
                    reply,
                } => {
                    let _ = reply.send(self.handle_update_selection(client_id, selection).await);
                }
                AuthorityRequest::State { reply } => {
                    let _ = reply.send(self.handle_state().await);
                }
            }
        }
        log::debug!("authority task for document {} stopped", self.doc_id);
    }

    // ─── Load / unload ────────────────────────────────────────────────

    /// Take the live state, loading it first if the document is not in
    /// memory. Handlers operate on the owned state and hand it back
    /// through [`restore`](Self::restore).
    async fn take_loaded(&mut self) -> Result<DocState, EngineError> {
        match self.state.take() {
            Some(state) => Ok(state),
            None => self.load().await,
        }
    }

    /// Put the state back unless the handler hit corruption, in which
    /// case the next request reloads from snapshot + log.
    fn restore<T>(&mut self, state: DocState, result: &Result<T, EngineError>) {
        match result {
            Err(EngineError::Corruption { detail, .. }) => {
                log::error!(
                    "document {}: {detail}; discarding in-memory state, reload forced",
                    self.doc_id
                );
            }
            _ => self.state = Some(state),
        }
    }

    /// Latest snapshot plus contiguous replay of every record after it.
    async fn load(&self) -> Result<DocState, EngineError> {
        let snapshot = self.snapshots.latest_snapshot(self.doc_id).await?;
        let (mut version, mut content) = match snapshot {
            Some(snapshot) => (snapshot.version, snapshot.content),
            None => (0, String::new()),
        };

        let records = self.log.operations_since(self.doc_id, version).await?;
        for record in records {
            if record.version != version + 1 {
                return Err(EngineError::Corruption {
                    doc_id: self.doc_id,
                    detail: format!(
                        "log gap during replay: expected version {}, found {}",
                        version + 1,
                        record.version
                    ),
                });
            }
            content = record.operation.apply(&content).map_err(|e| {
                EngineError::Corruption {
                    doc_id: self.doc_id,
                    detail: format!("replay failed at version {}: {e}", record.version),
                }
            })?;
            version = record.version;
        }

        // Prime the client cache from the authoritative directory.
        let clients = self
            .presence
            .clients(self.doc_id)
            .await?
            .into_iter()
            .map(|session| (session.client_id, session))
            .collect();

        log::info!("document {} loaded at version {version}", self.doc_id);
        Ok(DocState { version, content, clients })
    }

    /// Best-effort snapshot before the task exits. The log alone fully
    /// reconstructs the document, so a failed flush only costs replay
    /// time on the next load.
    async fn flush_final_snapshot(&mut self) {
        let Some(state) = self.state.take() else { return };
        if state.version == 0 {
            return;
        }
        let snapshot = Snapshot {
            doc_id: self.doc_id,
            version: state.version,
            content: state.content,
        };
        match self.snapshots.save_snapshot(snapshot).await {
            Ok(()) => log::info!(
                "document {}: final snapshot flushed at version {}",
                self.doc_id,
                state.version
            ),
            Err(e) => log::warn!(
                "document {}: final snapshot flush failed: {e}",
                self.doc_id
            ),
        }
    }

    // ─── Request handlers ─────────────────────────────────────────────

    async fn handle_join(&mut self, session: ClientSession) -> Result<InitState, EngineError> {
        let mut state = self.take_loaded().await?;
        let result = self.join(&mut state, session).await;
        self.restore(state, &result);
        result
    }

    async fn handle_leave(&mut self, client_id: Uuid) -> Result<usize, EngineError> {
        let mut state = self.take_loaded().await?;
        let result = self.leave(&mut state, client_id).await;
        self.restore(state, &result);
        result
    }

    async fn handle_submit(
        &mut self,
        client_id: Uuid,
        user_id: Uuid,
        client_version: u64,
        operation: Operation,
    ) -> Result<Commit, EngineError> {
        let mut state = self.take_loaded().await?;
        let result = self
            .submit(&mut state, client_id, user_id, client_version, operation)
            .await;
        self.restore(state, &result);
        result
    }

    async fn handle_update_cursor(
        &mut self,
        client_id: Uuid,
        cursor: usize,
    ) -> Result<(), EngineError> {
        let mut state = self.take_loaded().await?;
        let result = self.update_cursor(&mut state, client_id, cursor).await;
        self.restore(state, &result);
        result
    }

    async fn handle_update_selection(
        &mut self,
        client_id: Uuid,
        selection: Option<Selection>,
    ) -> Result<(), EngineError> {
        let mut state = self.take_loaded().await?;
        let result = self.update_selection(&mut state, client_id, selection).await;
        self.restore(state, &result);
        result
    }

    async fn handle_state(&mut self) -> Result<InitState, EngineError> {
        let state = self.take_loaded().await?;
        let result = Ok(Self::init_state(&state));
        self.restore(state, &result);
        result
    }

    // ─── Core operations ──────────────────────────────────────────────

    fn init_state(state: &DocState) -> InitState {
        InitState {
            version: state.version,
            content: state.content.clone(),
            clients: state.clients.values().cloned().collect(),
        }
    }

    /// Register the client, then compute its bootstrap state — in that
    /// order, so the state never misses the client's own presence entry.
    async fn join(
        &self,
        state: &mut DocState,
        session: ClientSession,
    ) -> Result<InitState, EngineError> {
        self.presence
            .add_client(self.doc_id, session.clone())
            .await?;
        state.clients.insert(session.client_id, session.clone());
        self.channel
            .publish(DocEvent::Presence(PresenceEvent::Join { session }));
        Ok(Self::init_state(state))
    }

    /// Remove the client; returns how many remain. The caller unloads
    /// the document when this hits zero.
    async fn leave(&self, state: &mut DocState, client_id: Uuid) -> Result<usize, EngineError> {
        if state.clients.remove(&client_id).is_none() {
            return Err(EngineError::NotFound(client_id));
        }
        if let Err(e) = self.presence.remove_client(self.doc_id, client_id).await {
            // Unload must not hang on the directory; the entry is
            // overwritten on the next registration anyway.
            log::warn!(
                "document {}: presence removal for {client_id} failed: {e}",
                self.doc_id
            );
        }
        self.channel
            .publish(DocEvent::Presence(PresenceEvent::Leave { client_id }));
        Ok(state.clients.len())
    }

    async fn submit(
        &self,
        state: &mut DocState,
        client_id: Uuid,
        user_id: Uuid,
        client_version: u64,
        operation: Operation,
    ) -> Result<Commit, EngineError> {
        if client_version > state.version {
            return Err(EngineError::Validation(format!(
                "client version {client_version} is ahead of document version {}",
                state.version
            )));
        }

        // 1. Fetch the operations the client did not know about.
        let missed = self.log.operations_since(self.doc_id, client_version).await?;
        let mut at = client_version;
        for record in &missed {
            if record.version != at + 1 {
                return Err(EngineError::Corruption {
                    doc_id: self.doc_id,
                    detail: format!(
                        "log gap behind version {}: expected {}, found {}",
                        state.version,
                        at + 1,
                        record.version
                    ),
                });
            }
            at = record.version;
        }
        if at != state.version {
            return Err(EngineError::Corruption {
                doc_id: self.doc_id,
                detail: format!("log ends at version {at}, memory at {}", state.version),
            });
        }

        // 2. Rebase across each missed operation in commit order. The
        //    lower client id's insert lands first at a contested
        //    position; the committed record wins a tie of equal ids.
        let mut rebased = operation;
        for record in &missed {
            rebased = if record.client_id <= client_id {
                transform(&record.operation, &rebased)?.1
            } else {
                transform(&rebased, &record.operation)?.0
            };
        }

        // 3. Apply to the current content. With rebasing in between, a
        //    mismatch here can no longer be the client's fault.
        let new_content = match rebased.apply(&state.content) {
            Ok(content) => content,
            Err(e) if missed.is_empty() => return Err(e.into()),
            Err(e) => {
                return Err(EngineError::Corruption {
                    doc_id: self.doc_id,
                    detail: format!(
                        "rebased operation failed against version {}: {e}",
                        state.version
                    ),
                })
            }
        };

        // 4. Persist, then commit. In-memory state moves only after the
        //    record is durable.
        let version = state.version + 1;
        let record = OperationRecord {
            doc_id: self.doc_id,
            version,
            client_id,
            user_id,
            operation: rebased.clone(),
            timestamp_ms: now_millis(),
        };
        self.save_with_retry(record).await?;

        state.version = version;
        state.content = new_content;
        log::debug!("document {} committed version {version}", self.doc_id);

        // 5. Broadcast the rebased form so every peer applies the same
        //    committed sequence.
        self.channel.publish(DocEvent::Committed {
            version,
            client_id,
            operation: rebased.clone(),
        });

        // 6. Snapshot cadence. An interval of zero disables periodic
        //    snapshots (the unload flush still runs).
        if self.config.snapshot_interval > 0 && version % self.config.snapshot_interval == 0 {
            let snapshot = Snapshot {
                doc_id: self.doc_id,
                version,
                content: state.content.clone(),
            };
            if let Err(e) = self.snapshots.save_snapshot(snapshot).await {
                log::warn!(
                    "document {}: snapshot at version {version} failed: {e}",
                    self.doc_id
                );
            }
        }

        // 7. Move everyone else's caret through the committed operation.
        self.propagate_cursors(state, client_id, &rebased).await;

        Ok(Commit { version, operation: rebased })
    }

    /// Append with bounded exponential backoff. A version conflict is
    /// not retriable: it means something else wrote the log, which the
    /// single-writer discipline rules out — treat as corruption.
    async fn save_with_retry(&self, record: OperationRecord) -> Result<(), EngineError> {
        let mut attempt = 0u32;
        loop {
            match self.log.save_operation(record.clone()).await {
                Ok(()) => return Ok(()),
                Err(StoreError::VersionConflict { expected, got }) => {
                    return Err(EngineError::Corruption {
                        doc_id: self.doc_id,
                        detail: format!(
                            "log advanced outside this authority: expected version {expected}, wrote {got}"
                        ),
                    });
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.retry.max_attempts {
                        return Err(EngineError::Persistence(format!(
                            "operation save failed after {attempt} attempts: {e}"
                        )));
                    }
                    let delay = self.config.retry.base_delay * 2u32.pow(attempt - 1);
                    log::warn!(
                        "document {}: operation save attempt {attempt} failed: {e}; retrying in {delay:?}",
                        self.doc_id
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Run every other client's cursor and selection through the
    /// committed operation, write the moves through to the directory,
    /// and broadcast the deltas.
    async fn propagate_cursors(
        &self,
        state: &mut DocState,
        author: Uuid,
        operation: &Operation,
    ) {
        for session in state.clients.values_mut() {
            if session.client_id == author {
                continue;
            }

            let moved = transform_cursor(session.cursor, operation, false);
            if moved != session.cursor {
                session.cursor = moved;
                if let Err(e) = self
                    .presence
                    .update_cursor(self.doc_id, session.client_id, moved)
                    .await
                {
                    log::warn!(
                        "document {}: cursor write-through for {} failed: {e}",
                        self.doc_id,
                        session.client_id
                    );
                }
                self.channel.publish(DocEvent::Presence(PresenceEvent::Cursor {
                    client_id: session.client_id,
                    cursor: moved,
                }));
            }

            let moved_selection = session.selection.map(|selection| Selection {
                anchor: transform_cursor(selection.anchor, operation, false),
                head: transform_cursor(selection.head, operation, false),
            });
            if moved_selection != session.selection {
                session.selection = moved_selection;
                if let Err(e) = self
                    .presence
                    .update_selection(self.doc_id, session.client_id, moved_selection)
                    .await
                {
                    log::warn!(
                        "document {}: selection write-through for {} failed: {e}",
                        self.doc_id,
                        session.client_id
                    );
                }
                self.channel
                    .publish(DocEvent::Presence(PresenceEvent::Selection {
                        client_id: session.client_id,
                        selection: moved_selection,
                    }));
            }
        }
    }

    async fn update_cursor(
        &self,
        state: &mut DocState,
        client_id: Uuid,
        cursor: usize,
    ) -> Result<(), EngineError> {
        let content_len = state.content.chars().count();
        if cursor > content_len {
            return Err(EngineError::Validation(format!(
                "cursor {cursor} beyond document length {content_len}"
            )));
        }
        let session = state
            .clients
            .get_mut(&client_id)
            .ok_or(EngineError::NotFound(client_id))?;
        session.cursor = cursor;

        if let Err(e) = self.presence.update_cursor(self.doc_id, client_id, cursor).await {
            log::warn!(
                "document {}: cursor write-through for {client_id} failed: {e}",
                self.doc_id
            );
        }
        self.channel
            .publish(DocEvent::Presence(PresenceEvent::Cursor { client_id, cursor }));
        Ok(())
    }

    async fn update_selection(
        &self,
        state: &mut DocState,
        client_id: Uuid,
        selection: Option<Selection>,
    ) -> Result<(), EngineError> {
        let content_len = state.content.chars().count();
        if let Some(selection) = selection {
            if selection.anchor > content_len || selection.head > content_len {
                return Err(EngineError::Validation(format!(
                    "selection {}..{} beyond document length {content_len}",
                    selection.anchor, selection.head
                )));
            }
        }
        let session = state
            .clients
            .get_mut(&client_id)
            .ok_or(EngineError::NotFound(client_id))?;
        session.selection = selection;

        if let Err(e) = self
            .presence
            .update_selection(self.doc_id, client_id, selection)
            .await
        {
            log::warn!(
                "document {}: selection write-through for {client_id} failed: {e}",
                self.doc_id
            );
        }
        self.channel
            .publish(DocEvent::Presence(PresenceEvent::Selection { client_id, selection }));
        Ok(())
    }
}
