//! Replicated data model: the node tree, documents, outbox entries and cursors.

pub mod cursor;
pub mod document;
pub mod mutation;
pub mod node;
pub mod role;

use uuid::Uuid;

pub type NodeId = Uuid;
pub type UserId = Uuid;
pub type DeviceId = Uuid;
pub type WorkspaceId = Uuid;

pub use cursor::{Cursor, StreamId};
pub use document::{Document, DocumentState, DocumentUpdate};
pub use mutation::{Mutation, MutationKind, MutationPayload, MutationStatus};
pub use node::{
    ChatAttributes, Collaborators, DatabaseAttributes, FolderAttributes, MessageAttributes, Node,
    NodeAttributes, NodeReaction, NodeType, PageAttributes, RecordAttributes, SpaceAttributes,
};
pub use role::Role;
