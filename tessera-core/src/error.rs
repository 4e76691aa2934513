//! Error taxonomy shared by the replica, the outbox and the server.

use thiserror::Error;

use crate::model::Role;

/// Failure raised by an attribute updater or by re-applying a patch.
///
/// Updaters are pure, so a `DomainError` always aborts the mutation
/// without touching stored state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("field not found: {0}")]
    FieldNotFound(String),
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("node type cannot change from {from} to {to}")]
    TypeChanged { from: String, to: String },
    #[error("{0}")]
    Rejected(String),
}

/// Errors surfaced by sync engine operations.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Malformed input (attributes, ids, wire payloads).
    #[error("validation failed: {0}")]
    Validation(String),
    /// Missing node, document or collaborator.
    #[error("not found: {0}")]
    NotFound(String),
    /// Caller's effective role is below the required minimum.
    #[error("unauthorized: requires {required}, has {actual}")]
    Unauthorized { required: Role, actual: Role },
    /// Stale base revision; recovered by rebase.
    #[error("conflict: base revision {base} but current is {current}")]
    ConflictRetry { base: u64, current: u64 },
    /// Transient transport failure.
    #[error("network error: {0}")]
    Network(String),
    /// Local replica corruption; needs a full resync.
    #[error("fatal replica error: {0}")]
    Fatal(String),
    /// Storage backend failure that is not corruption.
    #[error("storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl SyncError {
    /// Whether the outbox should keep retrying after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::ConflictRetry { .. })
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
