//! Registry of document authorities.
//!
//! One [`AuthorityRegistry`] serves a process. It owns the arena of
//! authority handles keyed by document id; callers never touch a
//! document's state directly — every mutation is a message through the
//! owning actor's handle. Handles of unloaded documents are replaced on
//! next access, and a request that races an unload is retried against the
//! fresh authority (which reloads from snapshot + log).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::authority::{ActorGone, AuthorityHandle, Commit, InitState};
use crate::broadcast::DocEvent;
use crate::error::EngineError;
use crate::presence::{ClientSession, PresenceDirectory, Selection};
use crate::storage::{OperationLog, SnapshotStore};
use concord_ot::Operation;

/// How often a request is retried against a fresh authority when the
/// previous one unloaded mid-flight.
const HANDLE_ATTEMPTS: usize = 3;

/// Commit-path retry policy for the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts before surfacing `Persistence`.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// A snapshot is written every this many committed versions.
    pub snapshot_interval: u64,
    /// Mailbox depth per document authority.
    pub mailbox_capacity: usize,
    /// Event buffer per document subscriber.
    pub broadcast_capacity: usize,
    /// Commit-path persistence retry.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 100,
            mailbox_capacity: 64,
            broadcast_capacity: 256,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Small buffers, tight snapshot cadence, fast retries.
    pub fn for_testing() -> Self {
        Self {
            snapshot_interval: 5,
            mailbox_capacity: 8,
            broadcast_capacity: 32,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        }
    }
}

/// Registry statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub authorities_spawned: u64,
    pub operations_committed: u64,
}

/// The arena of per-document authorities.
pub struct AuthorityRegistry<L, S, P> {
    config: EngineConfig,
    log: Arc<L>,
    snapshots: Arc<S>,
    presence: Arc<P>,
    authorities: Mutex<HashMap<Uuid, AuthorityHandle>>,
    authorities_spawned: AtomicU64,
    operations_committed: AtomicU64,
}

impl<L, S, P> AuthorityRegistry<L, S, P>
where
    L: OperationLog,
    S: SnapshotStore,
    P: PresenceDirectory,
{
    pub fn new(config: EngineConfig, log: Arc<L>, snapshots: Arc<S>, presence: Arc<P>) -> Self {
        Self {
            config,
            log,
            snapshots,
            presence,
            authorities: Mutex::new(HashMap::new()),
            authorities_spawned: AtomicU64::new(0),
            operations_committed: AtomicU64::new(0),
        }
    }

    /// Fetch the live handle for a document, spawning a fresh authority
    /// if there is none or the previous one has unloaded.
    async fn handle(&self, doc_id: Uuid) -> AuthorityHandle {
        let mut authorities = self.authorities.lock().await;
        if let Some(handle) = authorities.get(&doc_id) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }
        let handle = AuthorityHandle::spawn(
            doc_id,
            self.config.clone(),
            Arc::clone(&self.log),
            Arc::clone(&self.snapshots),
            Arc::clone(&self.presence),
        );
        self.authorities_spawned.fetch_add(1, Ordering::Relaxed);
        authorities.insert(doc_id, handle.clone());
        handle
    }

    /// Register a client and return the document's bootstrap state,
    /// computed after the registration lands.
    pub async fn join(
        &self,
        doc_id: Uuid,
        session: ClientSession,
    ) -> Result<InitState, EngineError> {
        for _ in 0..HANDLE_ATTEMPTS {
            let handle = self.handle(doc_id).await;
            match handle.join(session.clone()).await {
                Ok(result) => return result,
                Err(ActorGone) => continue,
            }
        }
        Err(restarting(doc_id))
    }

    /// Deregister a client. The document unloads (with a final snapshot
    /// flush) when its last client leaves.
    pub async fn leave(&self, doc_id: Uuid, client_id: Uuid) -> Result<(), EngineError> {
        for _ in 0..HANDLE_ATTEMPTS {
            let handle = self.handle(doc_id).await;
            match handle.leave(client_id).await {
                Ok(Ok(0)) => {
                    // Drop the dead handle so the map does not grow with
                    // unloaded documents.
                    let mut authorities = self.authorities.lock().await;
                    if let Some(existing) = authorities.get(&doc_id) {
                        if existing.is_closed() {
                            authorities.remove(&doc_id);
                        }
                    }
                    return Ok(());
                }
                Ok(result) => return result.map(|_| ()),
                Err(ActorGone) => continue,
            }
        }
        Err(restarting(doc_id))
    }

    /// Submit an operation built against `client_version`. Returns the
    /// commit holding the rebased operation — broadcast that form, never
    /// the original.
    pub async fn submit(
        &self,
        doc_id: Uuid,
        client_id: Uuid,
        user_id: Uuid,
        client_version: u64,
        operation: Operation,
    ) -> Result<Commit, EngineError> {
        for _ in 0..HANDLE_ATTEMPTS {
            let handle = self.handle(doc_id).await;
            match handle
                .submit(client_id, user_id, client_version, operation.clone())
                .await
            {
                Ok(result) => {
                    if result.is_ok() {
                        self.operations_committed.fetch_add(1, Ordering::Relaxed);
                    }
                    return result;
                }
                Err(ActorGone) => continue,
            }
        }
        Err(restarting(doc_id))
    }

    pub async fn update_cursor(
        &self,
        doc_id: Uuid,
        client_id: Uuid,
        cursor: usize,
    ) -> Result<(), EngineError> {
        for _ in 0..HANDLE_ATTEMPTS {
            let handle = self.handle(doc_id).await;
            match handle.update_cursor(client_id, cursor).await {
                Ok(result) => return result,
                Err(ActorGone) => continue,
            }
        }
        Err(restarting(doc_id))
    }

    pub async fn update_selection(
        &self,
        doc_id: Uuid,
        client_id: Uuid,
        selection: Option<Selection>,
    ) -> Result<(), EngineError> {
        for _ in 0..HANDLE_ATTEMPTS {
            let handle = self.handle(doc_id).await;
            match handle.update_selection(client_id, selection).await {
                Ok(result) => return result,
                Err(ActorGone) => continue,
            }
        }
        Err(restarting(doc_id))
    }

    /// Current `{version, content, clients}` without registering anyone.
    pub async fn state(&self, doc_id: Uuid) -> Result<InitState, EngineError> {
        for _ in 0..HANDLE_ATTEMPTS {
            let handle = self.handle(doc_id).await;
            match handle.state().await {
                Ok(result) => return result,
                Err(ActorGone) => continue,
            }
        }
        Err(restarting(doc_id))
    }

    /// Subscribe to a document's committed operations and presence
    /// deltas. Subscribing alone does not load the document.
    pub async fn subscribe(&self, doc_id: Uuid) -> broadcast::Receiver<DocEvent> {
        self.handle(doc_id).await.subscribe()
    }

    /// Documents with a live authority task.
    pub async fn active_documents(&self) -> usize {
        let authorities = self.authorities.lock().await;
        authorities.values().filter(|h| !h.is_closed()).count()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            authorities_spawned: self.authorities_spawned.load(Ordering::Relaxed),
            operations_committed: self.operations_committed.load(Ordering::Relaxed),
        }
    }
}

fn restarting(doc_id: Uuid) -> EngineError {
    EngineError::Persistence(format!(
        "document {doc_id} authority is restarting; retry the request"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::MemoryPresence;
    use crate::storage::MemoryStore;

    fn registry() -> AuthorityRegistry<MemoryStore, MemoryStore, MemoryPresence> {
        let store = Arc::new(MemoryStore::new());
        AuthorityRegistry::new(
            EngineConfig::for_testing(),
            Arc::clone(&store),
            store,
            Arc::new(MemoryPresence::new()),
        )
    }

    fn insert_op(text: &str) -> Operation {
        let mut op = Operation::new();
        op.insert(text);
        op
    }

    #[tokio::test]
    async fn test_join_creates_document_lazily() {
        let registry = registry();
        let doc_id = Uuid::new_v4();
        let session = ClientSession::new(Uuid::new_v4(), Uuid::new_v4(), "Alice");

        let init = registry.join(doc_id, session.clone()).await.unwrap();
        assert_eq!(init.version, 0);
        assert_eq!(init.content, "");
        // The joining client's own registration is visible.
        assert_eq!(init.clients.len(), 1);
        assert_eq!(init.clients[0].client_id, session.client_id);
        assert_eq!(registry.active_documents().await, 1);
    }

    #[tokio::test]
    async fn test_submit_and_version_advance() {
        let registry = registry();
        let doc_id = Uuid::new_v4();
        let session = ClientSession::new(Uuid::new_v4(), Uuid::new_v4(), "Alice");
        registry.join(doc_id, session.clone()).await.unwrap();

        let commit = registry
            .submit(doc_id, session.client_id, session.user_id, 0, insert_op("hello"))
            .await
            .unwrap();
        assert_eq!(commit.version, 1);

        let state = registry.state(doc_id).await.unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.content, "hello");
        assert_eq!(registry.stats().operations_committed, 1);
    }

    #[tokio::test]
    async fn test_submit_ahead_of_version_is_rejected() {
        let registry = registry();
        let doc_id = Uuid::new_v4();
        let session = ClientSession::new(Uuid::new_v4(), Uuid::new_v4(), "Alice");
        registry.join(doc_id, session.clone()).await.unwrap();

        let result = registry
            .submit(doc_id, session.client_id, session.user_id, 5, insert_op("x"))
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_stale_operation_wrong_length_is_client_error() {
        let registry = registry();
        let doc_id = Uuid::new_v4();
        let session = ClientSession::new(Uuid::new_v4(), Uuid::new_v4(), "Alice");
        registry.join(doc_id, session.clone()).await.unwrap();

        // Claims to be against version 0 (empty text) but retains 3.
        let mut op = Operation::new();
        op.retain(3);
        op.insert("!");
        let result = registry
            .submit(doc_id, session.client_id, session.user_id, 0, op)
            .await;
        assert!(matches!(result, Err(EngineError::LengthMismatch { .. })));
    }

    #[tokio::test]
    async fn test_leave_unknown_client() {
        let registry = registry();
        let doc_id = Uuid::new_v4();
        let session = ClientSession::new(Uuid::new_v4(), Uuid::new_v4(), "Alice");
        registry.join(doc_id, session).await.unwrap();

        let ghost = Uuid::new_v4();
        let result = registry.leave(doc_id, ghost).await;
        assert_eq!(result, Err(EngineError::NotFound(ghost)));
    }

    #[tokio::test]
    async fn test_unload_on_last_leave_and_respawn() {
        let registry = registry();
        let doc_id = Uuid::new_v4();
        let session = ClientSession::new(Uuid::new_v4(), Uuid::new_v4(), "Alice");

        registry.join(doc_id, session.clone()).await.unwrap();
        registry
            .submit(doc_id, session.client_id, session.user_id, 0, insert_op("hi"))
            .await
            .unwrap();
        registry.leave(doc_id, session.client_id).await.unwrap();
        assert_eq!(registry.active_documents().await, 0);

        // Rejoining reloads the document from the store.
        let init = registry.join(doc_id, session.clone()).await.unwrap();
        assert_eq!(init.version, 1);
        assert_eq!(init.content, "hi");
        assert!(registry.stats().authorities_spawned >= 2);
    }

    #[tokio::test]
    async fn test_cursor_update_flows_to_state() {
        let registry = registry();
        let doc_id = Uuid::new_v4();
        let session = ClientSession::new(Uuid::new_v4(), Uuid::new_v4(), "Alice");
        registry.join(doc_id, session.clone()).await.unwrap();
        registry
            .submit(doc_id, session.client_id, session.user_id, 0, insert_op("hello"))
            .await
            .unwrap();

        registry
            .update_cursor(doc_id, session.client_id, 3)
            .await
            .unwrap();
        let state = registry.state(doc_id).await.unwrap();
        assert_eq!(state.clients[0].cursor, 3);

        let result = registry.update_cursor(doc_id, session.client_id, 99).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }
}
