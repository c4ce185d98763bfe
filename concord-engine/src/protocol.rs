//! Binary wire protocol for operation submission and document events.
//!
//! Bincode-encoded for transport; the serde derives keep the operation
//! component shape (`{"retain":n}` / `{"insert":s}` / `{"delete":n}`) for
//! JSON-speaking clients. The transport layer itself (WebSocket or
//! otherwise) lives outside this crate — it decodes [`WireMessage`]s,
//! feeds submissions into the registry, and encodes the returned commits
//! and subscribed events back out.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broadcast::DocEvent;
use crate::presence::ClientSession;
use concord_ot::Operation;

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Client → authority: an operation built against `client_version`.
    Submit {
        doc_id: Uuid,
        client_id: Uuid,
        user_id: Uuid,
        client_version: u64,
        operation: Operation,
    },
    /// Authority → submitter: the commit, carrying the rebased operation.
    Ack {
        doc_id: Uuid,
        version: u64,
        operation: Operation,
    },
    /// Authority → subscribers: a committed operation or presence delta.
    Event { doc_id: Uuid, event: DocEvent },
    /// Authority → a joining client: bootstrap state.
    InitState {
        doc_id: Uuid,
        version: u64,
        content: String,
        clients: Vec<ClientSession>,
    },
}

impl WireMessage {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Serialization(e) => write!(f, "serialization error: {e}"),
            ProtocolError::Deserialization(e) => write!(f, "deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
