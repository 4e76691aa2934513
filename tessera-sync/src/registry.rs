//! Server-authoritative node registry.
//!
//! Every accepted change is validated, role-checked, compare-and-swapped on
//! the node revision, appended to its stream and published on the bus with
//! its position:
//!
//! ```text
//! MutationRequest ─► dedup(local_id) ─► validate ─► role check ─► CAS(base == revision)
//!                                                                     │
//!                     ┌──────────── mismatch ◄────────────────────────┤
//!                     ▼                                               ▼ match
//!               Retry{latest}                 commit_stream: node row + log entry + ack
//!                                                                     │
//!                                                                     ▼
//!                                                   EventBus ─► Synchronizers
//! ```
//!
//! Successful acks are stored under their `local_id`, so a replayed request
//! gets the original answer instead of being applied twice.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tessera_core::permissions::{check_create, check_delete, check_read, check_update};
use tessera_core::{
    now_millis, Collaborators, DomainError, Event, EventBus, EventKind, Node, NodeAttributes,
    NodeId, NodeReaction, Role, StreamId, SyncError, SyncResult, UserId, WorkspaceId,
};
use uuid::Uuid;

use crate::document_store::DocumentStore;
use crate::protocol::{decode_json, encode_json, MutationAck, MutationBody, MutationRequest};
use crate::storage::{LogRecord, Store};

/// Longest ancestor chain accepted before the tree is considered corrupt.
pub(crate) const MAX_DEPTH: usize = 64;

pub struct NodeRegistry {
    workspace_id: WorkspaceId,
    store: Arc<Store>,
    bus: EventBus,
    documents: Arc<DocumentStore>,
    /// Serializes every mutation from ack lookup to commit.
    commit_lock: Mutex<()>,
}

impl NodeRegistry {
    pub fn new(workspace_id: WorkspaceId, store: Arc<Store>, bus: EventBus) -> Self {
        let documents = Arc::new(DocumentStore::new(workspace_id, store.clone(), bus.clone()));
        Self {
            workspace_id,
            store,
            bus,
            documents,
            commit_lock: Mutex::new(()),
        }
    }

    pub fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id
    }

    pub fn documents(&self) -> &Arc<DocumentStore> {
        &self.documents
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn get_node(&self, id: NodeId) -> SyncResult<Option<Node>> {
        Ok(self.store.get_node(id)?)
    }

    /// `[root, ..., node]`.
    pub fn ancestry(&self, node: &Node) -> SyncResult<Vec<Node>> {
        ancestry_with(node, |id| Ok(self.store.get_node(id)?))
    }

    pub fn list_reactions(&self, node_id: NodeId) -> SyncResult<Vec<NodeReaction>> {
        Ok(self
            .store
            .list_reactions(node_id)?
            .into_iter()
            .filter(|r| r.deleted_at.is_none())
            .collect())
    }

    /// Apply one device mutation.
    ///
    /// Rejections come back as acks. `Err` is reserved for server-side
    /// failures, which the client should treat as transient.
    pub fn apply_mutation(&self, author: UserId, request: MutationRequest) -> SyncResult<MutationAck> {
        // Held across the ack lookup so a resubmission waits for the first attempt.
        let _commit = self.lock();
        if let Some(bytes) = self.store.get_ack(request.local_id)? {
            log::debug!("Replayed mutation {}; returning stored ack", request.local_id);
            return Ok(decode_json(&bytes)?);
        }

        let local_id = request.local_id;
        let result = match request.body {
            MutationBody::CreateNode { node } => {
                if node.id != request.node_id {
                    Err(SyncError::Validation("node id does not match the request".into()))
                } else {
                    self.create_node(author, local_id, node)
                }
            }
            MutationBody::UpdateNode { attributes } => {
                self.update_node(author, local_id, request.node_id, request.base_revision, attributes)
            }
            MutationBody::DeleteNode => self.delete_node(author, local_id, request.node_id),
            MutationBody::ApplyDocumentUpdate { data } => {
                self.apply_document_update(author, local_id, request.node_id, data)
            }
            MutationBody::AddReaction { reaction } => {
                self.add_reaction(author, local_id, request.node_id, reaction)
            }
            MutationBody::RemoveReaction { reaction } => {
                self.remove_reaction(author, local_id, request.node_id, &reaction)
            }
        };

        match result {
            Ok(ack) => Ok(ack),
            Err(e @ (SyncError::Storage(_) | SyncError::Fatal(_) | SyncError::Network(_))) => {
                log::error!("Mutation {local_id} failed on the server: {e}");
                Err(e)
            }
            Err(e) => {
                log::info!("Mutation {local_id} rejected: {e}");
                Ok(MutationAck::rejected(local_id, &e))
            }
        }
    }

    // ─── Nodes ────────────────────────────────────────────────────────

    fn create_node(&self, author: UserId, local_id: Uuid, mut node: Node) -> SyncResult<MutationAck> {
        if self.store.get_node(node.id)?.is_some() {
            return Err(SyncError::Validation(format!("node {} already exists", node.id)));
        }
        node.attributes.validate()?;

        let (parent, parent_chain) = match node.parent_id {
            Some(parent_id) => {
                let parent = self
                    .store
                    .get_node(parent_id)?
                    .ok_or_else(|| SyncError::NotFound(format!("parent {parent_id}")))?;
                let chain = self.ancestry(&parent)?;
                (Some(parent), chain)
            }
            None => (None, Vec::new()),
        };
        node.root_id = parent.as_ref().map_or(node.id, |p| p.root_id);
        node.validate_placement(parent.as_ref())?;
        check_create(&parent_chain, &node.attributes, author)?;

        node.revision = 0;
        node.created_by = author;
        node.created_at = now_millis();
        node.updated_by = None;
        node.updated_at = None;
        node.deleted_at = None;

        let (ack, position) = self.store.commit_stream(StreamId::Nodes, |positions, batch| {
            let position = positions.next();
            batch.put_node(&node)?;
            batch.put_log_record(StreamId::Nodes, &node_record(position, &node)?)?;
            let ack = MutationAck::success(local_id, Some(node.clone()), Some(position));
            batch.put_ack(local_id, encode_json(&ack)?);
            Ok::<_, SyncError>((ack, position))
        })?;

        log::info!("Created {} {} at position {position}", node.node_type(), node.id);
        self.publish(position, EventKind::NodeCreated { node: node.clone() });
        if let Some(collaborators) = node.attributes.collaborators() {
            for (user_id, role) in collaborators {
                self.collaborator_changed(&node, *user_id, *role);
            }
        }
        Ok(ack)
    }

    fn update_node(
        &self,
        author: UserId,
        local_id: Uuid,
        node_id: NodeId,
        base_revision: u64,
        attributes: NodeAttributes,
    ) -> SyncResult<MutationAck> {
        let current = self.live_node(node_id)?;
        check_update(&self.ancestry(&current)?, author)?;

        if base_revision != current.revision {
            log::debug!(
                "Stale update of {node_id}: base {base_revision}, current {}",
                current.revision
            );
            return Ok(MutationAck::retry(local_id, current));
        }
        let (node, position) = self.commit_attributes(current, attributes, author, Some(local_id))?;
        Ok(MutationAck::success(local_id, Some(node), Some(position)))
    }

    /// Grant, change or (with `Role::None`) revoke a user's role on a root.
    pub fn set_collaborator(&self, actor: UserId, root_id: NodeId, user_id: UserId, role: Role) -> SyncResult<Node> {
        let _commit = self.lock();
        let root = self.live_node(root_id)?;
        if !root.is_root() {
            return Err(SyncError::Validation(format!("{root_id} is not a root")));
        }
        check_update(std::slice::from_ref(&root), actor)?;

        let mut attributes = root.attributes.clone();
        let collaborators = attributes
            .collaborators_mut()
            .ok_or_else(|| SyncError::Validation("root carries no collaborators".into()))?;
        if role == Role::None {
            collaborators.remove(&user_id);
        } else {
            collaborators.insert(user_id, role);
        }
        let (node, _) = self.commit_attributes(root, attributes, actor, None)?;
        Ok(node)
    }

    /// CAS already passed; write the new attributes at `revision + 1`.
    fn commit_attributes(
        &self,
        current: Node,
        attributes: NodeAttributes,
        author: UserId,
        local_id: Option<Uuid>,
    ) -> SyncResult<(Node, u64)> {
        if attributes.node_type() != current.node_type() {
            return Err(DomainError::TypeChanged {
                from: current.node_type().to_string(),
                to: attributes.node_type().to_string(),
            }
            .into());
        }
        attributes.validate()?;

        let before: Collaborators = current.attributes.collaborators().cloned().unwrap_or_default();
        let updated = Node {
            revision: current.revision + 1,
            attributes,
            updated_by: Some(author),
            updated_at: Some(now_millis()),
            ..current
        };

        let position = self.store.commit_stream(StreamId::Nodes, |positions, batch| {
            let position = positions.next();
            batch.put_node(&updated)?;
            batch.put_log_record(StreamId::Nodes, &node_record(position, &updated)?)?;
            if let Some(local_id) = local_id {
                let ack = MutationAck::success(local_id, Some(updated.clone()), Some(position));
                batch.put_ack(local_id, encode_json(&ack)?);
            }
            Ok::<_, SyncError>(position)
        })?;

        log::debug!("Updated {} to revision {} at position {position}", updated.id, updated.revision);
        self.publish(position, EventKind::NodeUpdated { node: updated.clone() });
        let after = updated.attributes.collaborators().cloned().unwrap_or_default();
        for (user_id, role) in &after {
            if before.get(user_id) != Some(role) {
                self.collaborator_changed(&updated, *user_id, *role);
            }
        }
        for user_id in before.keys().filter(|u| !after.contains_key(*u)) {
            self.collaborator_changed(&updated, *user_id, Role::None);
        }
        Ok((updated, position))
    }

    fn delete_node(&self, author: UserId, local_id: Uuid, node_id: NodeId) -> SyncResult<MutationAck> {
        let current = self
            .store
            .get_node(node_id)?
            .ok_or_else(|| SyncError::NotFound(format!("node {node_id}")))?;
        if current.is_deleted() {
            return Ok(MutationAck::success(local_id, Some(current), None));
        }
        check_delete(&self.ancestry(&current)?, author)?;

        let now = now_millis();
        let doomed: Vec<Node> = self
            .live_subtree(&current)?
            .into_iter()
            .map(|node| Node {
                revision: node.revision + 1,
                updated_by: Some(author),
                updated_at: Some(now),
                deleted_at: Some(now),
                ..node
            })
            .collect();

        let (ack, entries) = self.store.commit_stream(StreamId::Nodes, |positions, batch| {
            let mut entries = Vec::with_capacity(doomed.len());
            for node in &doomed {
                let position = positions.next();
                batch.put_node(node)?;
                batch.put_log_record(StreamId::Nodes, &node_record(position, node)?)?;
                entries.push((position, node.clone()));
            }
            let (position, head) = entries
                .first()
                .cloned()
                .ok_or_else(|| SyncError::NotFound(format!("node {node_id}")))?;
            let ack = MutationAck::success(local_id, Some(head), Some(position));
            batch.put_ack(local_id, encode_json(&ack)?);
            Ok::<_, SyncError>((ack, entries))
        })?;

        log::info!("Deleted {node_id} and {} descendants", entries.len().saturating_sub(1));
        for (position, node) in entries {
            self.publish(position, EventKind::NodeDeleted { node });
        }
        Ok(ack)
    }

    /// `node` followed by its live descendants, breadth first.
    fn live_subtree(&self, node: &Node) -> SyncResult<Vec<Node>> {
        let mut children: HashMap<NodeId, Vec<Node>> = HashMap::new();
        for candidate in self.store.list_root_nodes(node.root_id)? {
            if let Some(parent_id) = candidate.parent_id {
                if !candidate.is_deleted() {
                    children.entry(parent_id).or_default().push(candidate);
                }
            }
        }

        let mut subtree = vec![node.clone()];
        let mut seen = HashSet::from([node.id]);
        let mut queue = VecDeque::from([node.id]);
        while let Some(id) = queue.pop_front() {
            for child in children.remove(&id).unwrap_or_default() {
                if seen.insert(child.id) {
                    queue.push_back(child.id);
                    subtree.push(child);
                }
            }
        }
        Ok(subtree)
    }

    // ─── Documents ────────────────────────────────────────────────────

    fn apply_document_update(
        &self,
        author: UserId,
        local_id: Uuid,
        node_id: NodeId,
        data: Vec<u8>,
    ) -> SyncResult<MutationAck> {
        let node = self.live_node(node_id)?;
        check_update(&self.ancestry(&node)?, author)?;
        let update = self.documents.append_update(&node, data, author, |update, batch| {
            let ack = MutationAck::success(local_id, None, Some(update.id));
            batch.put_ack(local_id, encode_json(&ack)?);
            Ok(())
        })?;
        Ok(MutationAck::success(local_id, None, Some(update.id)))
    }

    // ─── Reactions ────────────────────────────────────────────────────

    fn add_reaction(&self, author: UserId, local_id: Uuid, node_id: NodeId, reaction: String) -> SyncResult<MutationAck> {
        let node = self.live_node(node_id)?;
        check_read(&self.ancestry(&node)?, author)?;
        if reaction.trim().is_empty() {
            return Err(SyncError::Validation("reaction is empty".into()));
        }
        if let Some(existing) = self.store.get_reaction(node_id, author, &reaction)? {
            if existing.deleted_at.is_none() {
                return Ok(MutationAck::success(local_id, None, None));
            }
        }
        let reaction = NodeReaction {
            node_id,
            root_id: node.root_id,
            user_id: author,
            reaction,
            created_at: now_millis(),
            deleted_at: None,
        };
        let position = self.commit_reaction(local_id, &reaction)?;
        self.publish(position, EventKind::ReactionCreated { reaction });
        Ok(MutationAck::success(local_id, None, Some(position)))
    }

    fn remove_reaction(&self, author: UserId, local_id: Uuid, node_id: NodeId, reaction: &str) -> SyncResult<MutationAck> {
        let node = self.live_node(node_id)?;
        check_read(&self.ancestry(&node)?, author)?;
        let Some(existing) = self
            .store
            .get_reaction(node_id, author, reaction)?
            .filter(|r| r.deleted_at.is_none())
        else {
            return Ok(MutationAck::success(local_id, None, None));
        };
        let removed = NodeReaction {
            deleted_at: Some(now_millis()),
            ..existing
        };
        let position = self.commit_reaction(local_id, &removed)?;
        self.publish(position, EventKind::ReactionDeleted { reaction: removed });
        Ok(MutationAck::success(local_id, None, Some(position)))
    }

    fn commit_reaction(&self, local_id: Uuid, reaction: &NodeReaction) -> SyncResult<u64> {
        self.store.commit_stream(StreamId::Reactions, |positions, batch| {
            let position = positions.next();
            batch.put_reaction(reaction)?;
            batch.put_log_record(
                StreamId::Reactions,
                &LogRecord {
                    position,
                    entity_id: reaction.node_id,
                    root_id: reaction.root_id,
                    revision: position,
                    payload: encode_json(reaction)?,
                },
            )?;
            let ack = MutationAck::success(local_id, None, Some(position));
            batch.put_ack(local_id, encode_json(&ack)?);
            Ok::<_, SyncError>(position)
        })
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_node(&self, id: NodeId) -> SyncResult<Node> {
        self.store
            .get_node(id)?
            .filter(|node| !node.is_deleted())
            .ok_or_else(|| SyncError::NotFound(format!("node {id}")))
    }

    fn publish(&self, position: u64, kind: EventKind) {
        self.bus.publish(Event::at(self.workspace_id, position, kind));
    }

    fn collaborator_changed(&self, node: &Node, user_id: UserId, role: Role) {
        self.bus.publish(Event::local(
            self.workspace_id,
            EventKind::CollaboratorChanged {
                root_id: node.root_id,
                node_id: node.id,
                user_id,
                role,
            },
        ));
    }
}

/// Walk parent links from `node` up to its root.
pub(crate) fn ancestry_with<F>(node: &Node, mut lookup: F) -> SyncResult<Vec<Node>>
where
    F: FnMut(NodeId) -> SyncResult<Option<Node>>,
{
    let mut chain = vec![node.clone()];
    let mut seen = HashSet::from([node.id]);
    let mut current = node.parent_id;
    while let Some(parent_id) = current {
        if !seen.insert(parent_id) || chain.len() > MAX_DEPTH {
            return Err(SyncError::Fatal(format!("ancestor cycle at node {parent_id}")));
        }
        let parent = lookup(parent_id)?.ok_or_else(|| SyncError::NotFound(format!("ancestor {parent_id}")))?;
        current = parent.parent_id;
        chain.push(parent);
    }
    chain.reverse();
    Ok(chain)
}

fn node_record(position: u64, node: &Node) -> SyncResult<LogRecord> {
    Ok(LogRecord {
        position,
        entity_id: node.id,
        root_id: node.root_id,
        revision: node.revision,
        payload: node.to_json()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AckStatus;
    use crate::storage::StoreConfig;
    use tempfile::TempDir;
    use tessera_core::{MessageAttributes, PageAttributes, SpaceAttributes};

    struct Fixture {
        registry: NodeRegistry,
        owner: UserId,
        root: Node,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
        let registry = NodeRegistry::new(Uuid::new_v4(), store, EventBus::default());
        let owner = Uuid::new_v4();
        let root = space(owner);
        let ack = registry.apply_mutation(owner, create(&root)).unwrap();
        assert_eq!(ack.status, AckStatus::Success);
        Fixture {
            registry,
            owner,
            root: ack.latest.unwrap(),
            _dir: dir,
        }
    }

    fn space(owner: UserId) -> Node {
        let id = Uuid::new_v4();
        Node {
            id,
            parent_id: None,
            root_id: id,
            revision: 0,
            attributes: NodeAttributes::Space(SpaceAttributes {
                name: "Team".into(),
                description: None,
                avatar: None,
                collaborators: [(owner, Role::Owner)].into_iter().collect(),
            }),
            created_by: owner,
            created_at: 0,
            updated_by: None,
            updated_at: None,
            deleted_at: None,
        }
    }

    fn child(parent: &Node, attributes: NodeAttributes) -> Node {
        Node {
            id: Uuid::new_v4(),
            parent_id: Some(parent.id),
            root_id: parent.root_id,
            attributes,
            ..parent.clone()
        }
    }

    fn page_attrs(name: &str) -> NodeAttributes {
        NodeAttributes::Page(PageAttributes {
            name: name.into(),
            avatar: None,
            collaborators: None,
        })
    }

    fn create(node: &Node) -> MutationRequest {
        MutationRequest {
            local_id: Uuid::new_v4(),
            node_id: node.id,
            base_revision: 0,
            body: MutationBody::CreateNode { node: node.clone() },
        }
    }

    fn update(node_id: NodeId, base_revision: u64, attributes: NodeAttributes) -> MutationRequest {
        MutationRequest {
            local_id: Uuid::new_v4(),
            node_id,
            base_revision,
            body: MutationBody::UpdateNode { attributes },
        }
    }

    #[test]
    fn test_create_child_derives_root() {
        let f = fixture();
        let mut page = child(&f.root, page_attrs("Plan"));
        page.root_id = Uuid::new_v4();
        let ack = f.registry.apply_mutation(f.owner, create(&page)).unwrap();
        assert_eq!(ack.status, AckStatus::Success);
        let stored = ack.latest.unwrap();
        assert_eq!(stored.root_id, f.root.id);
        assert_eq!(stored.revision, 0);
        assert_eq!(f.registry.ancestry(&stored).unwrap().len(), 2);
    }

    #[test]
    fn test_compare_and_swap_on_revision() {
        let f = fixture();
        let page = child(&f.root, page_attrs("Draft"));
        f.registry.apply_mutation(f.owner, create(&page)).unwrap();

        let first = f.registry.apply_mutation(f.owner, update(page.id, 0, page_attrs("A"))).unwrap();
        assert_eq!(first.status, AckStatus::Success);
        assert_eq!(first.latest.as_ref().unwrap().revision, 1);

        let second = f.registry.apply_mutation(f.owner, update(page.id, 0, page_attrs("B"))).unwrap();
        assert_eq!(second.status, AckStatus::Retry);
        let latest = second.latest.unwrap();
        assert_eq!(latest.revision, 1);
        assert_eq!(latest.attributes.name(), Some("A"));
    }

    #[test]
    fn test_replayed_request_returns_stored_ack() {
        let f = fixture();
        let page = child(&f.root, page_attrs("Draft"));
        f.registry.apply_mutation(f.owner, create(&page)).unwrap();

        let request = update(page.id, 0, page_attrs("Once"));
        let first = f.registry.apply_mutation(f.owner, request.clone()).unwrap();
        let replay = f.registry.apply_mutation(f.owner, request).unwrap();
        assert_eq!(first, replay);
        assert_eq!(f.registry.get_node(page.id).unwrap().unwrap().revision, 1);
    }

    /// Submit `request` from two threads released together.
    fn submit_twice(f: &Fixture, request: &MutationRequest) -> [MutationAck; 2] {
        let barrier = std::sync::Barrier::new(2);
        let submit = || {
            barrier.wait();
            f.registry.apply_mutation(f.owner, request.clone()).unwrap()
        };
        std::thread::scope(|scope| {
            let first = scope.spawn(submit);
            let second = scope.spawn(submit);
            [first.join().unwrap(), second.join().unwrap()]
        })
    }

    #[test]
    fn test_concurrent_resubmissions_share_one_ack() {
        let f = fixture();
        let page = child(&f.root, page_attrs("Draft"));
        let [first, second] = submit_twice(&f, &create(&page));
        assert_eq!(first.status, AckStatus::Success);
        assert_eq!(first, second);

        let delta = crate::crdt::append_text(&[], "once").unwrap();
        let append = MutationRequest {
            local_id: Uuid::new_v4(),
            node_id: page.id,
            base_revision: 0,
            body: MutationBody::ApplyDocumentUpdate { data: delta },
        };
        let [first, second] = submit_twice(&f, &append);
        assert_eq!(first.status, AckStatus::Success);
        assert_eq!(first, second);
        assert_eq!(f.registry.documents().list_updates(page.id, 0).unwrap().len(), 1);
        assert_eq!(f.registry.documents().content(page.id).unwrap(), "once");
    }

    #[test]
    fn test_viewer_cannot_create_pages() {
        let f = fixture();
        let viewer = Uuid::new_v4();
        f.registry.set_collaborator(f.owner, f.root.id, viewer, Role::Viewer).unwrap();
        let page = child(&f.root, page_attrs("Nope"));
        let ack = f.registry.apply_mutation(viewer, create(&page)).unwrap();
        assert_eq!(ack.status, AckStatus::Unauthorized);
        assert!(f.registry.get_node(page.id).unwrap().is_none());
    }

    #[test]
    fn test_invalid_attributes_fail() {
        let f = fixture();
        let page = child(&f.root, page_attrs("  "));
        let ack = f.registry.apply_mutation(f.owner, create(&page)).unwrap();
        assert_eq!(ack.status, AckStatus::Failed);
    }

    #[test]
    fn test_delete_cascades_to_subtree() {
        let f = fixture();
        let page = child(&f.root, page_attrs("Parent"));
        f.registry.apply_mutation(f.owner, create(&page)).unwrap();
        let nested = child(&page, page_attrs("Nested"));
        f.registry.apply_mutation(f.owner, create(&nested)).unwrap();

        let mut events = f.registry.bus.stream();
        let request = MutationRequest {
            local_id: Uuid::new_v4(),
            node_id: page.id,
            base_revision: 0,
            body: MutationBody::DeleteNode,
        };
        let ack = f.registry.apply_mutation(f.owner, request).unwrap();
        assert_eq!(ack.status, AckStatus::Success);

        assert!(f.registry.get_node(nested.id).unwrap().unwrap().is_deleted());
        let mut deleted = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event.kind, EventKind::NodeDeleted { .. }) {
                deleted += 1;
            }
        }
        assert_eq!(deleted, 2);

        // updates to deleted nodes are rejected
        let ack = f.registry.apply_mutation(f.owner, update(nested.id, 1, page_attrs("x"))).unwrap();
        assert_eq!(ack.status, AckStatus::Failed);
    }

    #[test]
    fn test_collaborator_changes_are_published() {
        let f = fixture();
        let guest = Uuid::new_v4();
        let mut events = f.registry.bus.stream();
        let root = f.registry.set_collaborator(f.owner, f.root.id, guest, Role::Editor).unwrap();
        assert_eq!(root.revision, 1);

        let mut saw_change = false;
        while let Ok(event) = events.try_recv() {
            if let EventKind::CollaboratorChanged { user_id, role, .. } = &event.kind {
                saw_change |= *user_id == guest && *role == Role::Editor;
            }
        }
        assert!(saw_change);

        // editors cannot administer the root
        assert!(f.registry.set_collaborator(guest, f.root.id, guest, Role::Owner).is_err());
    }

    #[test]
    fn test_reactions_are_idempotent() {
        let f = fixture();
        let chat_message = child(
            &f.root,
            NodeAttributes::Message(MessageAttributes {
                text: "ship it".into(),
                reference_id: None,
            }),
        );
        let channel = child(&f.root, NodeAttributes::Channel(PageAttributes {
            name: "general".into(),
            avatar: None,
            collaborators: None,
        }));
        f.registry.apply_mutation(f.owner, create(&channel)).unwrap();
        let message = Node {
            parent_id: Some(channel.id),
            ..chat_message
        };
        f.registry.apply_mutation(f.owner, create(&message)).unwrap();

        let react = |body| MutationRequest {
            local_id: Uuid::new_v4(),
            node_id: message.id,
            base_revision: 0,
            body,
        };
        let first = f
            .registry
            .apply_mutation(f.owner, react(MutationBody::AddReaction { reaction: "👍".into() }))
            .unwrap();
        assert!(first.position.is_some());
        let again = f
            .registry
            .apply_mutation(f.owner, react(MutationBody::AddReaction { reaction: "👍".into() }))
            .unwrap();
        assert_eq!(again.position, None);
        assert_eq!(f.registry.list_reactions(message.id).unwrap().len(), 1);

        f.registry
            .apply_mutation(f.owner, react(MutationBody::RemoveReaction { reaction: "👍".into() }))
            .unwrap();
        assert!(f.registry.list_reactions(message.id).unwrap().is_empty());
    }

    #[test]
    fn test_ancestry_detects_cycles() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let mut node_a = child(&space(owner), page_attrs("a"));
        node_a.id = a;
        node_a.parent_id = Some(b);
        let node_b = Node {
            id: b,
            parent_id: Some(a),
            ..node_a.clone()
        };
        let lookup = |id: NodeId| Ok(if id == a { Some(node_a.clone()) } else { Some(node_b.clone()) });
        assert!(matches!(ancestry_with(&node_a, lookup), Err(SyncError::Fatal(_))));
    }
}
