//! # concord-engine — Document authority for collaborative editing
//!
//! Serializes concurrent edits per document, rebases them with
//! [`concord_ot`], and keeps the durable history that makes every client
//! converge on the same text.
//!
//! ## Architecture
//!
//! ```text
//! submit(clientVersion, op)      ┌──────────────────────┐
//! ─────────────────────────────► │  AuthorityRegistry   │
//!                                │  (arena of handles)  │
//!                                └─────────┬────────────┘
//!                                          │ one mailbox per doc
//!                                          ▼
//!                                ┌──────────────────────┐
//!                                │  DocumentAuthority   │── transform ──► concord-ot
//!                                │  (single writer)     │
//!                                └──┬────────┬──────┬───┘
//!                      operations   │        │      │ presence deltas
//!                      ┌────────────┘        │      └────────────┐
//!                      ▼                     ▼                   ▼
//!              ┌──────────────┐      ┌──────────────┐    ┌──────────────┐
//!              │ OperationLog │      │ SnapshotStore│    │ Presence     │
//!              │ (append-only)│      │ (derived)    │    │ Directory    │
//!              └──────────────┘      └──────────────┘    └──────────────┘
//!                                          │
//!                      committed + presence events fan out per document
//!                                          ▼
//!                                ┌──────────────────────┐
//!                                │  DocumentChannel     │──► subscribers
//!                                └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`registry`] — arena of per-document authority handles
//! - [`authority`] — the single-writer actor (load, rebase, commit)
//! - [`storage`] — operation log + snapshot store traits, memory and
//!   RocksDB implementations
//! - [`presence`] — client sessions, cursor/selection, directory trait
//! - [`broadcast`] — per-document event fan-out
//! - [`protocol`] — binary wire encoding
//! - [`error`] — the engine error taxonomy
//!
//! ## Guarantees
//!
//! - Version increases by exactly 1 per committed operation, never skips.
//! - Persist-then-commit: in-memory state advances only after the record
//!   is durable.
//! - Every subscriber observes the same rebased operation sequence.

pub mod authority;
pub mod broadcast;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod storage;

// Re-exports for convenience
pub use authority::{Commit, InitState};
pub use broadcast::{ChannelStats, DocEvent, DocumentChannel};
pub use error::EngineError;
pub use presence::{
    ClientSession, MemoryPresence, PresenceDirectory, PresenceEvent, Selection,
};
pub use protocol::{ProtocolError, WireMessage};
pub use registry::{AuthorityRegistry, EngineConfig, EngineStats, RetryPolicy};
pub use storage::{
    MemoryStore, OperationLog, OperationRecord, RocksStore, Snapshot, SnapshotStore,
    StoreConfig, StoreError,
};
