//! Presence: who is editing a document, and where their caret is.
//!
//! The authoritative client list lives in an external presence directory
//! (multiple authority instances may serve a fleet); each document
//! authority keeps only a write-through read cache of it. Cursor and
//! selection offsets are character positions in the document text and are
//! moved through committed operations with
//! [`transform_cursor`](concord_ot::transform_cursor).

use std::collections::HashMap;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::storage::StoreError;

/// A selection range in character offsets. `anchor` is where the
/// selection started, `head` where the caret is; `head < anchor` for a
/// backwards selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

/// One connected editing session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSession {
    /// Connection identity (one per socket/session).
    pub client_id: Uuid,
    /// The human behind it (stable across reconnects).
    pub user_id: Uuid,
    /// Display name.
    pub name: String,
    /// Caret position, character offset.
    pub cursor: usize,
    /// Active selection, if any.
    pub selection: Option<Selection>,
}

impl ClientSession {
    pub fn new(client_id: Uuid, user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            client_id,
            user_id,
            name: name.into(),
            cursor: 0,
            selection: None,
        }
    }
}

/// Presence deltas broadcast to a document's subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceEvent {
    /// A client joined the document.
    Join { session: ClientSession },
    /// A client left (clean disconnect or otherwise).
    Leave { client_id: Uuid },
    /// A caret moved.
    Cursor { client_id: Uuid, cursor: usize },
    /// A selection changed or was cleared.
    Selection {
        client_id: Uuid,
        selection: Option<Selection>,
    },
}

impl PresenceEvent {
    /// The client this event concerns, for any variant.
    pub fn client_id(&self) -> Uuid {
        match self {
            PresenceEvent::Join { session } => session.client_id,
            PresenceEvent::Leave { client_id } => *client_id,
            PresenceEvent::Cursor { client_id, .. } => *client_id,
            PresenceEvent::Selection { client_id, .. } => *client_id,
        }
    }
}

/// The cross-process presence directory. This is the authority for the
/// client list; in-memory maps are caches of it.
pub trait PresenceDirectory: Send + Sync + 'static {
    fn clients(
        &self,
        doc_id: Uuid,
    ) -> impl Future<Output = Result<Vec<ClientSession>, StoreError>> + Send;

    fn add_client(
        &self,
        doc_id: Uuid,
        session: ClientSession,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn remove_client(
        &self,
        doc_id: Uuid,
        client_id: Uuid,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn update_cursor(
        &self,
        doc_id: Uuid,
        client_id: Uuid,
        cursor: usize,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn update_selection(
        &self,
        doc_id: Uuid,
        client_id: Uuid,
        selection: Option<Selection>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Process-local presence directory for tests and single-node setups.
#[derive(Default)]
pub struct MemoryPresence {
    documents: RwLock<HashMap<Uuid, HashMap<Uuid, ClientSession>>>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PresenceDirectory for MemoryPresence {
    async fn clients(&self, doc_id: Uuid) -> Result<Vec<ClientSession>, StoreError> {
        let documents = self.documents.read().await;
        Ok(documents
            .get(&doc_id)
            .map(|clients| clients.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_client(&self, doc_id: Uuid, session: ClientSession) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        documents
            .entry(doc_id)
            .or_default()
            .insert(session.client_id, session);
        Ok(())
    }

    async fn remove_client(&self, doc_id: Uuid, client_id: Uuid) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        if let Some(clients) = documents.get_mut(&doc_id) {
            clients.remove(&client_id);
            if clients.is_empty() {
                documents.remove(&doc_id);
            }
        }
        Ok(())
    }

    async fn update_cursor(
        &self,
        doc_id: Uuid,
        client_id: Uuid,
        cursor: usize,
    ) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        let session = documents
            .get_mut(&doc_id)
            .and_then(|clients| clients.get_mut(&client_id))
            .ok_or(StoreError::NotFound(client_id))?;
        session.cursor = cursor;
        Ok(())
    }

    async fn update_selection(
        &self,
        doc_id: Uuid,
        client_id: Uuid,
        selection: Option<Selection>,
    ) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        let session = documents
            .get_mut(&doc_id)
            .and_then(|clients| clients.get_mut(&client_id))
            .ok_or(StoreError::NotFound(client_id))?;
        session.selection = selection;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(name: &str) -> ClientSession {
        ClientSession::new(Uuid::new_v4(), Uuid::new_v4(), name)
    }

    #[tokio::test]
    async fn test_add_remove_clients() {
        let presence = MemoryPresence::new();
        let doc_id = Uuid::new_v4();

        let alice = session("Alice");
        let bob = session("Bob");
        presence.add_client(doc_id, alice.clone()).await.unwrap();
        presence.add_client(doc_id, bob.clone()).await.unwrap();

        let clients = presence.clients(doc_id).await.unwrap();
        assert_eq!(clients.len(), 2);

        presence.remove_client(doc_id, alice.client_id).await.unwrap();
        let clients = presence.clients(doc_id).await.unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].client_id, bob.client_id);
    }

    #[tokio::test]
    async fn test_remove_last_client_clears_document() {
        let presence = MemoryPresence::new();
        let doc_id = Uuid::new_v4();
        let alice = session("Alice");

        presence.add_client(doc_id, alice.clone()).await.unwrap();
        presence.remove_client(doc_id, alice.client_id).await.unwrap();

        assert!(presence.clients(doc_id).await.unwrap().is_empty());
        assert!(presence.documents.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_cursor_and_selection() {
        let presence = MemoryPresence::new();
        let doc_id = Uuid::new_v4();
        let alice = session("Alice");

        presence.add_client(doc_id, alice.clone()).await.unwrap();
        presence
            .update_cursor(doc_id, alice.client_id, 7)
            .await
            .unwrap();
        presence
            .update_selection(
                doc_id,
                alice.client_id,
                Some(Selection { anchor: 2, head: 7 }),
            )
            .await
            .unwrap();

        let clients = presence.clients(doc_id).await.unwrap();
        assert_eq!(clients[0].cursor, 7);
        assert_eq!(clients[0].selection, Some(Selection { anchor: 2, head: 7 }));
    }

    #[tokio::test]
    async fn test_update_unknown_client_fails() {
        let presence = MemoryPresence::new();
        let doc_id = Uuid::new_v4();
        let ghost = Uuid::new_v4();

        let result = presence.update_cursor(doc_id, ghost, 0).await;
        assert_eq!(result, Err(StoreError::NotFound(ghost)));
    }

    #[test]
    fn test_presence_event_client_id() {
        let alice = session("Alice");
        let id = alice.client_id;
        assert_eq!(PresenceEvent::Join { session: alice }.client_id(), id);
        assert_eq!(PresenceEvent::Leave { client_id: id }.client_id(), id);
        assert_eq!(
            PresenceEvent::Cursor { client_id: id, cursor: 3 }.client_id(),
            id
        );
        assert_eq!(
            PresenceEvent::Selection { client_id: id, selection: None }.client_id(),
            id
        );
    }
}
