//! Persistence interfaces for the operation log and snapshot store.
//!
//! ```text
//! ┌────────────────┐   save_operation     ┌───────────────────┐
//! │ DocumentAuthority│ ──────────────────► │ OperationLog       │
//! │ (in-memory)     │   operations_since   │ (append-only,      │
//! └───────┬────────┘ ◄────────────────── │  source of truth)  │
//!         │                               └───────────────────┘
//!         │ every N versions              ┌───────────────────┐
//!         └─────────────────────────────► │ SnapshotStore      │
//!                                         │ (derived, bounds   │
//!                                         │  replay cost only) │
//!                                         └───────────────────┘
//! ```
//!
//! The log is the single source of truth for document history: one record
//! per committed version, never updated, never deleted. Snapshots are a
//! derived checkpoint and are never authoritative over the log, which is
//! why neither trait exposes record deletion or compaction.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use std::future::Future;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use concord_ot::Operation;

/// One committed operation, persisted at its version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub doc_id: Uuid,
    /// 1-based: the version the document reached when this committed.
    pub version: u64,
    pub client_id: Uuid,
    pub user_id: Uuid,
    pub operation: Operation,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

/// A materialized `(version, content)` checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub doc_id: Uuid,
    pub version: u64,
    pub content: String,
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend failure (I/O, database internals).
    Database(String),
    /// No record for the given id.
    NotFound(Uuid),
    /// An append at the wrong version — the log only grows by one.
    VersionConflict { expected: u64, got: u64 },
    /// Encoding a value failed.
    Serialization(String),
    /// Decoding a stored value failed.
    Deserialization(String),
    /// Compressed value could not be unpacked.
    Compression(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "database error: {e}"),
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::VersionConflict { expected, got } => {
                write!(f, "version conflict: expected {expected}, got {got}")
            }
            StoreError::Serialization(e) => write!(f, "serialization error: {e}"),
            StoreError::Deserialization(e) => write!(f, "deserialization error: {e}"),
            StoreError::Compression(e) => write!(f, "compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// The append-only operation log.
pub trait OperationLog: Send + Sync + 'static {
    /// All records with version strictly greater than `version`, in
    /// ascending version order.
    fn operations_since(
        &self,
        doc_id: Uuid,
        version: u64,
    ) -> impl Future<Output = Result<Vec<OperationRecord>, StoreError>> + Send;

    /// Append one record. The record's version must be exactly one past
    /// the last appended version for its document.
    fn save_operation(
        &self,
        record: OperationRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// The snapshot checkpoint store. Only the most recent snapshot per
/// document is observable.
pub trait SnapshotStore: Send + Sync + 'static {
    fn latest_snapshot(
        &self,
        doc_id: Uuid,
    ) -> impl Future<Output = Result<Option<Snapshot>, StoreError>> + Send;

    fn save_snapshot(
        &self,
        snapshot: Snapshot,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
