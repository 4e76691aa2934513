//! # tessera-core — Domain model and scheduling primitives for Tessera
//!
//! Everything in this crate is free of I/O: the node tree model, role
//! resolution, attribute patches, domain events, and the two generic
//! primitives (`EventLoop`, `BackoffCalculator`) that drive retries and
//! coalescing in `tessera-sync`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   updater    ┌────────────────┐   diff    ┌───────────────┐
//! │ NodeAttributes│ ──────────► │ NodeAttributes │ ────────► │ AttributePatch│
//! │ (base rev)   │              │ (edited)       │           │ (key paths)   │
//! └──────────────┘              └────────────────┘           └───────┬───────┘
//!                                                                    │ rebase
//!                                                                    ▼
//!                                                         latest attributes
//! ```
//!
//! ## Modules
//!
//! - [`model`] — nodes, roles, documents, mutations, cursors
//! - [`patch`] — key-path attribute patches
//! - [`permissions`] — effective role resolution
//! - [`event`] — domain events and the injected `EventBus`
//! - [`event_loop`] — debounced scheduler with run coalescing
//! - [`backoff`] — exponential retry gate
//! - [`error`] — error taxonomy

pub mod backoff;
pub mod error;
pub mod event;
pub mod event_loop;
pub mod model;
pub mod patch;
pub mod permissions;

pub use backoff::{BackoffCalculator, BackoffConfig};
pub use error::{DomainError, SyncError, SyncResult};
pub use event::{Event, EventBus, EventKind, Subscription};
pub use event_loop::{EventLoop, EventLoopConfig, LoopStatus};
pub use model::{
    ChatAttributes, Collaborators, Cursor, DatabaseAttributes, DeviceId, Document,
    DocumentState, DocumentUpdate, FolderAttributes, MessageAttributes, Mutation, MutationKind,
    MutationPayload, MutationStatus, Node, NodeAttributes, NodeId, NodeReaction, NodeType,
    PageAttributes, RecordAttributes, Role, SpaceAttributes, StreamId, UserId, WorkspaceId,
};
pub use patch::{AttributePatch, PatchOp};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
