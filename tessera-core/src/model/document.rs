use serde::{Deserialize, Serialize};

use super::{NodeId, UserId};

/// Materialized view of a node's rich-text document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub node_id: NodeId,
    /// Bumped on every local merge.
    pub local_revision: u64,
    /// Highest server update id folded into this view.
    pub server_revision: u64,
    pub content: String,
    pub created_by: UserId,
    pub created_at: u64,
    pub updated_by: Option<UserId>,
    pub updated_at: Option<u64>,
}

/// CRDT snapshot. `revision` is the id of the last update folded in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentState {
    pub node_id: NodeId,
    pub revision: u64,
    pub state: Vec<u8>,
}

impl DocumentState {
    pub fn empty(node_id: NodeId) -> Self {
        Self {
            node_id,
            revision: 0,
            state: Vec::new(),
        }
    }
}

/// One appended CRDT delta. `id` is server-assigned and monotonic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentUpdate {
    pub id: u64,
    pub document_id: NodeId,
    pub author_id: UserId,
    pub data: Vec<u8>,
    pub applied_at: u64,
}
