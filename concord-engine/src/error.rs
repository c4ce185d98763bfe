//! Engine error taxonomy.
//!
//! Errors split into client-class failures (`Validation`, `LengthMismatch`
//! — the submitter must reload its document version and resubmit),
//! infrastructure failures (`Persistence` — retriable with backoff), and
//! `Corruption`, which is fatal for the affected document: the authority
//! discards its in-memory state and reloads from snapshot + log before
//! accepting further mutations.

use uuid::Uuid;

use crate::storage::StoreError;
use concord_ot::OtError;

/// Errors surfaced at the operation-submission boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed request: bad operation shape or an impossible client
    /// version. Not retriable as submitted.
    Validation(String),
    /// The operation does not fit the document content at the declared
    /// base version. The client must reload and resubmit.
    LengthMismatch { expected: usize, actual: usize },
    /// The operation log or snapshot store is unavailable. Retriable with
    /// a fresh client version.
    Persistence(String),
    /// No such document or client session.
    NotFound(Uuid),
    /// The log and in-memory state disagree after a correct rebase. The
    /// document is reloaded from snapshot + log; the submission is lost.
    Corruption { doc_id: Uuid, detail: String },
}

impl EngineError {
    /// True for failures the caller may retry unchanged.
    pub fn is_retriable(&self) -> bool {
        matches!(self, EngineError::Persistence(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(detail) => write!(f, "invalid submission: {detail}"),
            EngineError::LengthMismatch { expected, actual } => {
                write!(f, "operation expects {expected} characters, document has {actual}")
            }
            EngineError::Persistence(detail) => write!(f, "persistence failure: {detail}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Corruption { doc_id, detail } => {
                write!(f, "document {doc_id} corrupted: {detail}")
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

impl From<OtError> for EngineError {
    fn from(e: OtError) -> Self {
        match e {
            OtError::LengthMismatch { expected, actual } => {
                EngineError::LengthMismatch { expected, actual }
            }
            // A base-length disagreement during rebase means the client's
            // operation was built against a different text than its
            // declared version — same remedy as a direct mismatch.
            OtError::BaseLengthMismatch { left, right } => EngineError::LengthMismatch {
                expected: left,
                actual: right,
            },
            OtError::EmptyComponent => {
                EngineError::Validation("operation contains an empty component".into())
            }
        }
    }
}
