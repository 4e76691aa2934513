//! Effective role resolution and per-operation minimum roles.
//!
//! Roles are resolved along the ancestor chain, root first. The deepest node
//! carrying an explicit entry for the user wins, so a page with its own
//! collaborators map overrides what the root grants.

use crate::error::{SyncError, SyncResult};
use crate::model::{Node, NodeAttributes, NodeType, Role, UserId};

/// Effective role of `user` given the chain `[root, ..., node]`.
pub fn effective_role(chain: &[Node], user: UserId) -> Role {
    chain
        .iter()
        .filter_map(|node| node.attributes.collaborators())
        .filter_map(|collaborators| collaborators.get(&user).copied())
        .last()
        .unwrap_or(Role::None)
}

fn require(actual: Role, required: Role) -> SyncResult<()> {
    if actual.at_least(required) {
        Ok(())
    } else {
        Err(SyncError::Unauthorized { required, actual })
    }
}

/// Minimum role on the parent chain to create a child of `node_type`.
pub fn create_requirement(node_type: NodeType) -> Role {
    match node_type {
        NodeType::Record | NodeType::Message => Role::Collaborator,
        _ => Role::Editor,
    }
}

/// Check that `user` may create `attributes` under `parent_chain`.
///
/// Roots are created by their first collaborator, who must be listed with at
/// least collaborator rights.
pub fn check_create(parent_chain: &[Node], attributes: &NodeAttributes, user: UserId) -> SyncResult<()> {
    let node_type = attributes.node_type();
    if node_type.is_root() {
        let granted = attributes
            .collaborators()
            .and_then(|c| c.get(&user).copied())
            .unwrap_or(Role::None);
        return require(granted, Role::Collaborator);
    }
    require(effective_role(parent_chain, user), create_requirement(node_type))
}

/// Check that `user` may update the last node of `chain`.
pub fn check_update(chain: &[Node], user: UserId) -> SyncResult<()> {
    let node = chain
        .last()
        .ok_or_else(|| SyncError::NotFound("empty ancestor chain".into()))?;
    let role = effective_role(chain, user);
    match node.node_type() {
        NodeType::Space | NodeType::Chat => require(role, Role::Admin),
        NodeType::Message => {
            if node.created_by != user {
                return Err(SyncError::Unauthorized {
                    required: Role::Owner,
                    actual: role,
                });
            }
            require(role, Role::Collaborator)
        }
        NodeType::Record if node.created_by == user => require(role, Role::Collaborator),
        _ => require(role, Role::Editor),
    }
}

/// Check that `user` may delete the last node of `chain`.
pub fn check_delete(chain: &[Node], user: UserId) -> SyncResult<()> {
    let node = chain
        .last()
        .ok_or_else(|| SyncError::NotFound("empty ancestor chain".into()))?;
    let role = effective_role(chain, user);
    let authored_leaf = node.created_by == user
        && matches!(node.node_type(), NodeType::Message | NodeType::Record);
    if authored_leaf {
        require(role, Role::Collaborator)
    } else {
        require(role, Role::Admin)
    }
}

/// Readers need at least viewer access.
pub fn check_read(chain: &[Node], user: UserId) -> SyncResult<()> {
    require(effective_role(chain, user), Role::Viewer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageAttributes, PageAttributes, SpaceAttributes};
    use uuid::Uuid;

    fn node(attributes: NodeAttributes, parent: Option<&Node>, created_by: UserId) -> Node {
        let id = Uuid::new_v4();
        Node {
            id,
            parent_id: parent.map(|p| p.id),
            root_id: parent.map_or(id, |p| p.root_id),
            revision: 0,
            attributes,
            created_by,
            created_at: 0,
            updated_by: None,
            updated_at: None,
            deleted_at: None,
        }
    }

    fn space_with(members: &[(UserId, Role)]) -> Node {
        node(
            NodeAttributes::Space(SpaceAttributes {
                name: "Space".into(),
                description: None,
                avatar: None,
                collaborators: members.iter().copied().collect(),
            }),
            None,
            members[0].0,
        )
    }

    #[test]
    fn test_role_inherited_from_root() {
        let u1 = Uuid::new_v4();
        let root = space_with(&[(u1, Role::Editor)]);
        let page = node(
            NodeAttributes::Page(PageAttributes {
                name: "Notes".into(),
                avatar: None,
                collaborators: None,
            }),
            Some(&root),
            u1,
        );
        assert_eq!(effective_role(&[root.clone(), page.clone()], u1), Role::Editor);
        assert_eq!(effective_role(&[root, page], Uuid::new_v4()), Role::None);
    }

    #[test]
    fn test_explicit_descendant_map_overrides() {
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let root = space_with(&[(u1, Role::Owner), (u2, Role::Viewer)]);
        let page = node(
            NodeAttributes::Page(PageAttributes {
                name: "Private".into(),
                avatar: None,
                collaborators: Some([(u2, Role::Editor)].into_iter().collect()),
            }),
            Some(&root),
            u1,
        );
        let chain = [root, page];
        assert_eq!(effective_role(&chain, u2), Role::Editor);
        assert_eq!(effective_role(&chain, u1), Role::Owner);
        assert!(check_update(&chain, u2).is_ok());
    }

    #[test]
    fn test_root_update_requires_admin() {
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let root = space_with(&[(u1, Role::Admin), (u2, Role::Editor)]);
        assert!(check_update(std::slice::from_ref(&root), u1).is_ok());
        assert!(matches!(
            check_update(std::slice::from_ref(&root), u2),
            Err(SyncError::Unauthorized { required: Role::Admin, actual: Role::Editor })
        ));
        assert!(matches!(
            check_update(std::slice::from_ref(&root), Uuid::new_v4()),
            Err(SyncError::Unauthorized { actual: Role::None, .. })
        ));
    }

    #[test]
    fn test_message_edit_is_author_only() {
        let author = Uuid::new_v4();
        let admin = Uuid::new_v4();
        let root = space_with(&[(admin, Role::Admin), (author, Role::Collaborator)]);
        let message = node(
            NodeAttributes::Message(MessageAttributes {
                text: "hello".into(),
                reference_id: None,
            }),
            Some(&root),
            author,
        );
        let chain = [root, message];
        assert!(check_update(&chain, author).is_ok());
        assert!(check_update(&chain, admin).is_err());
        // admins may still delete it, and so may the author
        assert!(check_delete(&chain, admin).is_ok());
        assert!(check_delete(&chain, author).is_ok());
    }

    #[test]
    fn test_create_requirements() {
        let u1 = Uuid::new_v4();
        let viewer = Uuid::new_v4();
        let root = space_with(&[(u1, Role::Collaborator), (viewer, Role::Viewer)]);
        let chain = [root];
        let message = NodeAttributes::Message(MessageAttributes {
            text: "hi".into(),
            reference_id: None,
        });
        let page = NodeAttributes::Page(PageAttributes {
            name: "Spec".into(),
            avatar: None,
            collaborators: None,
        });
        assert!(check_create(&chain, &message, u1).is_ok());
        assert!(check_create(&chain, &page, u1).is_err());
        assert!(check_create(&chain, &message, viewer).is_err());
        assert!(check_read(&chain, viewer).is_ok());
    }

    #[test]
    fn test_root_creator_must_be_listed() {
        let u1 = Uuid::new_v4();
        let attrs = NodeAttributes::Space(SpaceAttributes {
            name: "Mine".into(),
            description: None,
            avatar: None,
            collaborators: [(u1, Role::Admin)].into_iter().collect(),
        });
        assert!(check_create(&[], &attrs, u1).is_ok());
        assert!(check_create(&[], &attrs, Uuid::new_v4()).is_err());
    }
}
