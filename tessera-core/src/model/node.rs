//! Node envelope and the closed set of typed attribute bags.
//!
//! Attributes are JSON on the wire and at rest. The `type` tag selects the
//! variant; each variant is validated on construction and after every
//! updater run, so an ill-shaped attribute bag never reaches storage.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use super::{NodeId, Role, UserId};
use crate::error::{DomainError, SyncError, SyncResult};

const MAX_NAME_LEN: usize = 256;

/// `{userId: role}` access map carried by roots and optionally by descendants.
pub type Collaborators = BTreeMap<UserId, Role>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Space,
    Chat,
    Folder,
    Page,
    Channel,
    Database,
    Record,
    Message,
}

impl NodeType {
    /// Top-level containers own their collaborators map and are their own root.
    pub fn is_root(self) -> bool {
        matches!(self, NodeType::Space | NodeType::Chat)
    }

    /// Nodes whose creation by someone else counts as unread activity.
    pub fn is_activity(self) -> bool {
        matches!(self, NodeType::Message | NodeType::Record)
    }

    /// Parent types this node type may be placed under.
    pub fn allowed_parents(self) -> &'static [NodeType] {
        match self {
            NodeType::Space | NodeType::Chat => &[],
            NodeType::Folder | NodeType::Page | NodeType::Channel | NodeType::Database => {
                &[NodeType::Space, NodeType::Folder, NodeType::Page]
            }
            NodeType::Record => &[NodeType::Database],
            NodeType::Message => &[
                NodeType::Chat,
                NodeType::Channel,
                NodeType::Page,
                NodeType::Record,
            ],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Space => "space",
            NodeType::Chat => "chat",
            NodeType::Folder => "folder",
            NodeType::Page => "page",
            NodeType::Channel => "channel",
            NodeType::Database => "database",
            NodeType::Record => "record",
            NodeType::Message => "message",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceAttributes {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub collaborators: Collaborators,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatAttributes {
    pub collaborators: Collaborators,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderAttributes {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collaborators: Option<Collaborators>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageAttributes {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collaborators: Option<Collaborators>,
}

/// Channels share the page shape; they hold message streams.
pub type ChannelAttributes = PageAttributes;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseAttributes {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Field id → field kind (`text`, `number`, `select`, ...).
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collaborators: Option<Collaborators>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordAttributes {
    pub database_id: NodeId,
    pub name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAttributes {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<NodeId>,
}

/// Type-tagged attribute bag. The JSON form is `{"type": "page", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeAttributes {
    Space(SpaceAttributes),
    Chat(ChatAttributes),
    Folder(FolderAttributes),
    Page(PageAttributes),
    Channel(ChannelAttributes),
    Database(DatabaseAttributes),
    Record(RecordAttributes),
    Message(MessageAttributes),
}

impl NodeAttributes {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeAttributes::Space(_) => NodeType::Space,
            NodeAttributes::Chat(_) => NodeType::Chat,
            NodeAttributes::Folder(_) => NodeType::Folder,
            NodeAttributes::Page(_) => NodeType::Page,
            NodeAttributes::Channel(_) => NodeType::Channel,
            NodeAttributes::Database(_) => NodeType::Database,
            NodeAttributes::Record(_) => NodeType::Record,
            NodeAttributes::Message(_) => NodeType::Message,
        }
    }

    /// Explicit collaborators map, if this node carries one.
    pub fn collaborators(&self) -> Option<&Collaborators> {
        match self {
            NodeAttributes::Space(a) => Some(&a.collaborators),
            NodeAttributes::Chat(a) => Some(&a.collaborators),
            NodeAttributes::Folder(a) => a.collaborators.as_ref(),
            NodeAttributes::Page(a) | NodeAttributes::Channel(a) => a.collaborators.as_ref(),
            NodeAttributes::Database(a) => a.collaborators.as_ref(),
            NodeAttributes::Record(_) | NodeAttributes::Message(_) => None,
        }
    }

    /// Mutable collaborators map. Descendant containers get an empty map on demand.
    pub fn collaborators_mut(&mut self) -> Option<&mut Collaborators> {
        match self {
            NodeAttributes::Space(a) => Some(&mut a.collaborators),
            NodeAttributes::Chat(a) => Some(&mut a.collaborators),
            NodeAttributes::Folder(a) => Some(a.collaborators.get_or_insert_with(Default::default)),
            NodeAttributes::Page(a) | NodeAttributes::Channel(a) => {
                Some(a.collaborators.get_or_insert_with(Default::default))
            }
            NodeAttributes::Database(a) => {
                Some(a.collaborators.get_or_insert_with(Default::default))
            }
            NodeAttributes::Record(_) | NodeAttributes::Message(_) => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            NodeAttributes::Space(a) => Some(&a.name),
            NodeAttributes::Folder(a) => Some(&a.name),
            NodeAttributes::Page(a) | NodeAttributes::Channel(a) => Some(&a.name),
            NodeAttributes::Database(a) => Some(&a.name),
            NodeAttributes::Record(a) => Some(&a.name),
            NodeAttributes::Chat(_) | NodeAttributes::Message(_) => None,
        }
    }

    /// Check the type-specific required shape.
    pub fn validate(&self) -> SyncResult<()> {
        if let Some(name) = self.name() {
            if name.trim().is_empty() {
                return Err(SyncError::Validation(format!("{} name is empty", self.node_type())));
            }
            if name.chars().count() > MAX_NAME_LEN {
                return Err(SyncError::Validation(format!(
                    "{} name exceeds {MAX_NAME_LEN} characters",
                    self.node_type()
                )));
            }
        }

        match self {
            NodeAttributes::Space(a) if a.collaborators.is_empty() => {
                Err(SyncError::Validation("space requires at least one collaborator".into()))
            }
            NodeAttributes::Chat(a) if a.collaborators.is_empty() => {
                Err(SyncError::Validation("chat requires at least one collaborator".into()))
            }
            NodeAttributes::Message(a) if a.text.trim().is_empty() => {
                Err(SyncError::Validation("message text is empty".into()))
            }
            NodeAttributes::Record(a) => {
                for (field, value) in &a.fields {
                    if field.is_empty() {
                        return Err(SyncError::Validation("record field id is empty".into()));
                    }
                    if value.is_null() {
                        return Err(SyncError::Validation(format!(
                            "record field `{field}` is null; remove it instead"
                        )));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn to_value(&self) -> Result<Value, DomainError> {
        serde_json::to_value(self).map_err(|e| DomainError::InvalidValue {
            field: "attributes".into(),
            reason: e.to_string(),
        })
    }

    pub fn from_value(value: Value) -> Result<Self, DomainError> {
        serde_json::from_value(value).map_err(|e| DomainError::InvalidValue {
            field: "attributes".into(),
            reason: e.to_string(),
        })
    }
}

/// Common envelope around typed attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub root_id: NodeId,
    /// Server-assigned, per node, 0 at creation.
    pub revision: u64,
    pub attributes: NodeAttributes,
    pub created_by: UserId,
    pub created_at: u64,
    #[serde(default)]
    pub updated_by: Option<UserId>,
    #[serde(default)]
    pub updated_at: Option<u64>,
    #[serde(default)]
    pub deleted_at: Option<u64>,
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        self.attributes.node_type()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_root(&self) -> bool {
        self.node_type().is_root()
    }

    /// Check placement against the parent and derive nothing; `root_id` must
    /// already be set by the caller.
    pub fn validate_placement(&self, parent: Option<&Node>) -> SyncResult<()> {
        let node_type = self.node_type();
        match (node_type.is_root(), parent) {
            (true, None) => {
                if self.root_id != self.id || self.parent_id.is_some() {
                    return Err(SyncError::Validation(format!(
                        "{node_type} must be its own root"
                    )));
                }
                Ok(())
            }
            (true, Some(_)) => Err(SyncError::Validation(format!(
                "{node_type} cannot have a parent"
            ))),
            (false, None) => Err(SyncError::Validation(format!("{node_type} requires a parent"))),
            (false, Some(parent)) => {
                if parent.is_deleted() {
                    return Err(SyncError::NotFound(format!("parent {} is deleted", parent.id)));
                }
                if !node_type.allowed_parents().contains(&parent.node_type()) {
                    return Err(SyncError::Validation(format!(
                        "{node_type} cannot be placed under {}",
                        parent.node_type()
                    )));
                }
                if let NodeAttributes::Record(record) = &self.attributes {
                    if record.database_id != parent.id {
                        return Err(SyncError::Validation(
                            "record database_id must match its parent".into(),
                        ));
                    }
                }
                if self.root_id != parent.root_id {
                    return Err(SyncError::Validation(
                        "root_id must match the parent's root".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    pub fn to_json(&self) -> SyncResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SyncError::Validation(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> SyncResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| SyncError::Validation(e.to_string()))
    }
}

/// A user's reaction on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReaction {
    pub node_id: NodeId,
    pub root_id: NodeId,
    pub user_id: UserId,
    pub reaction: String,
    pub created_at: u64,
    #[serde(default)]
    pub deleted_at: Option<u64>,
}
