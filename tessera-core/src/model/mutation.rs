use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Node, NodeId};
use crate::patch::AttributePatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    CreateNode,
    UpdateNode,
    DeleteNode,
    ApplyDocumentUpdate,
    AddReaction,
    RemoveReaction,
}

/// Body of a pending local change.
///
/// Updates carry a key-path patch rather than whole attributes so that a
/// rebase onto newer server attributes only touches the paths this change
/// actually wrote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationPayload {
    CreateNode { node: Node },
    UpdateNode { patch: AttributePatch },
    DeleteNode,
    ApplyDocumentUpdate { data: Vec<u8> },
    AddReaction { reaction: String },
    RemoveReaction { reaction: String },
}

impl MutationPayload {
    pub fn kind(&self) -> MutationKind {
        match self {
            MutationPayload::CreateNode { .. } => MutationKind::CreateNode,
            MutationPayload::UpdateNode { .. } => MutationKind::UpdateNode,
            MutationPayload::DeleteNode => MutationKind::DeleteNode,
            MutationPayload::ApplyDocumentUpdate { .. } => MutationKind::ApplyDocumentUpdate,
            MutationPayload::AddReaction { .. } => MutationKind::AddReaction,
            MutationPayload::RemoveReaction { .. } => MutationKind::RemoveReaction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    Sent,
    Acked,
    Failed,
}

/// Outbox entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Client-generated; the server deduplicates on it.
    pub local_id: Uuid,
    /// Outbox order key, assigned on enqueue.
    #[serde(default)]
    pub sequence: u64,
    pub node_id: NodeId,
    pub kind: MutationKind,
    pub payload: MutationPayload,
    pub base_revision: u64,
    pub status: MutationStatus,
    pub attempt: u32,
    pub created_at: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Mutation {
    pub fn new(node_id: NodeId, base_revision: u64, payload: MutationPayload) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            sequence: 0,
            node_id,
            kind: payload.kind(),
            payload,
            base_revision,
            status: MutationStatus::Pending,
            attempt: 0,
            created_at: crate::now_millis(),
            last_error: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, MutationStatus::Pending | MutationStatus::Sent)
    }
}
