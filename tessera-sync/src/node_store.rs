//! Client-side node replica.
//!
//! Two tables per node: the last server-confirmed row (`server_nodes`) and
//! the local row (`nodes`) the application reads. The local row is always
//! the server row with every pending outbox entry for that node replayed on
//! top:
//!
//! ```text
//!   server_nodes[id] ──► + pending patches (sequence order) ──► nodes[id]
//!         ▲                        ▲
//!   replication / acks        MutationOutbox
//! ```
//!
//! Local edits write the new local row and the outbox entry in one batch,
//! so a crash can never leave an optimistic change without its mutation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use tessera_core::permissions::{check_create, check_delete, check_read, check_update};
use tessera_core::{
    now_millis, AttributePatch, DeviceId, Document, DomainError, Event, EventBus, EventKind,
    Mutation, MutationPayload, Node, NodeAttributes, NodeId, NodeReaction, SyncError, SyncResult,
    UserId, WorkspaceId,
};
use uuid::Uuid;

use crate::crdt;
use crate::document_store::DocumentStore;
use crate::locks::EntityLocks;
use crate::outbox::{MutationOutbox, MutationSink, MutationTransport, OutboxConfig};
use crate::registry::ancestry_with;
use crate::storage::{Store, StoreBatch};

/// Result of [`NodeStore::update_node`].
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Success(Node),
    Unauthorized,
    NotFound,
    Failed(SyncError),
}

impl UpdateOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UpdateOutcome::Success(_))
    }
}

pub struct NodeStore {
    pub(crate) workspace_id: WorkspaceId,
    pub(crate) user_id: UserId,
    pub(crate) device_id: DeviceId,
    pub(crate) store: Arc<Store>,
    pub(crate) bus: EventBus,
    pub(crate) locks: EntityLocks,
    pub(crate) outbox: Arc<MutationOutbox>,
    pub(crate) documents: DocumentStore,
}

impl NodeStore {
    pub fn new(
        workspace_id: WorkspaceId,
        user_id: UserId,
        device_id: DeviceId,
        store: Arc<Store>,
        bus: EventBus,
        config: OutboxConfig,
    ) -> SyncResult<Self> {
        let outbox = Arc::new(MutationOutbox::new(workspace_id, store.clone(), bus.clone(), config)?);
        let documents = DocumentStore::new(workspace_id, store.clone(), bus.clone());
        Ok(Self {
            workspace_id,
            user_id,
            device_id,
            store,
            bus,
            locks: EntityLocks::new(),
            outbox,
            documents,
        })
    }

    /// Start draining the outbox through `transport`.
    pub fn start(self: &Arc<Self>, transport: Arc<dyn MutationTransport>) {
        let sink: Weak<dyn MutationSink> = Arc::<Self>::downgrade(self);
        self.outbox.start(transport, sink);
    }

    pub fn stop(&self) {
        self.outbox.stop();
    }

    pub fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn outbox(&self) -> &Arc<MutationOutbox> {
        &self.outbox
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Local row, soft-deleted ones included.
    pub fn get_node(&self, id: NodeId) -> SyncResult<Option<Node>> {
        Ok(self.store.get_node(id)?)
    }

    /// Last row the server confirmed.
    pub fn get_server_node(&self, id: NodeId) -> SyncResult<Option<Node>> {
        Ok(self.store.get_server_node(id)?.map(|row| row.node))
    }

    /// `[root, ..., node]` over local rows.
    pub fn ancestry(&self, node: &Node) -> SyncResult<Vec<Node>> {
        ancestry_with(node, |id| Ok(self.store.get_node(id)?))
    }

    pub fn list_children(&self, parent_id: NodeId) -> SyncResult<Vec<Node>> {
        let Some(parent) = self.store.get_node(parent_id)? else {
            return Ok(Vec::new());
        };
        Ok(self
            .store
            .list_root_nodes(parent.root_id)?
            .into_iter()
            .filter(|n| n.parent_id == Some(parent_id) && !n.is_deleted())
            .collect())
    }

    pub fn get_document(&self, node_id: NodeId) -> SyncResult<Option<Document>> {
        self.documents.get_document(node_id)
    }

    pub fn list_reactions(&self, node_id: NodeId) -> SyncResult<Vec<NodeReaction>> {
        Ok(self
            .store
            .list_reactions(node_id)?
            .into_iter()
            .filter(|r| r.deleted_at.is_none())
            .collect())
    }

    // ─── Nodes ────────────────────────────────────────────────────────

    /// Create a node locally at revision 0 and queue it for the server.
    pub async fn create_node(
        &self,
        id: NodeId,
        parent_id: Option<NodeId>,
        attributes: NodeAttributes,
    ) -> SyncResult<Node> {
        let _guard = self.locks.lock(id).await;
        if self.store.get_node(id)?.is_some() {
            return Err(SyncError::Validation(format!("node {id} already exists")));
        }
        attributes.validate()?;

        let (parent, parent_chain) = match parent_id {
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
        let node = Node {
            id,
            parent_id,
            root_id: parent.as_ref().map_or(id, |p| p.root_id),
            revision: 0,
            attributes,
            created_by: self.user_id,
            created_at: now_millis(),
            updated_by: None,
            updated_at: None,
            deleted_at: None,
        };
        node.validate_placement(parent.as_ref())?;
        check_create(&parent_chain, &node.attributes, self.user_id)?;

        let mut batch = StoreBatch::new();
        batch.put_node(&node)?;
        self.outbox.enqueue_in(
            Mutation::new(id, 0, MutationPayload::CreateNode { node: node.clone() }),
            &mut batch,
        )?;
        self.store.commit(batch)?;
        self.outbox.trigger();

        log::debug!("Created {} {id} locally", node.node_type());
        self.publish_local(EventKind::NodeCreated { node: node.clone() });
        Ok(node)
    }

    /// Apply `updater` to the node's attributes and queue the resulting patch.
    ///
    /// The patch, not the attributes, is what gets replayed when the server
    /// reports a newer revision, so edits to disjoint keys both survive.
    pub async fn update_node<F>(&self, id: NodeId, updater: F) -> UpdateOutcome
    where
        F: FnOnce(NodeAttributes) -> Result<NodeAttributes, DomainError>,
    {
        match self.try_update(id, updater).await {
            Ok(node) => UpdateOutcome::Success(node),
            Err(SyncError::NotFound(_)) => UpdateOutcome::NotFound,
            Err(SyncError::Unauthorized { .. }) => UpdateOutcome::Unauthorized,
            Err(e) => UpdateOutcome::Failed(e),
        }
    }

    async fn try_update<F>(&self, id: NodeId, updater: F) -> SyncResult<Node>
    where
        F: FnOnce(NodeAttributes) -> Result<NodeAttributes, DomainError>,
    {
        let _guard = self.locks.lock(id).await;
        let node = self.live_node(id)?;
        check_update(&self.ancestry(&node)?, self.user_id)?;

        let (attributes, patch) = AttributePatch::from_updater(&node.attributes, updater)?;
        if patch.is_empty() {
            return Ok(node);
        }
        attributes.validate()?;

        let base_revision = self.get_server_node(id)?.map_or(0, |n| n.revision);
        let updated = Node {
            revision: node.revision + 1,
            attributes,
            updated_by: Some(self.user_id),
            updated_at: Some(now_millis()),
            ..node
        };

        let mut batch = StoreBatch::new();
        batch.put_node(&updated)?;
        self.outbox.enqueue_in(
            Mutation::new(id, base_revision, MutationPayload::UpdateNode { patch }),
            &mut batch,
        )?;
        self.store.commit(batch)?;
        self.outbox.trigger();

        self.publish_local(EventKind::NodeUpdated { node: updated.clone() });
        Ok(updated)
    }

    /// Soft-delete the node and its subtree. Deleting twice is a no-op.
    pub async fn delete_node(&self, id: NodeId) -> SyncResult<()> {
        let _guard = self.locks.lock(id).await;
        let node = self
            .store
            .get_node(id)?
            .ok_or_else(|| SyncError::NotFound(format!("node {id}")))?;
        if node.is_deleted() {
            return Ok(());
        }
        check_delete(&self.ancestry(&node)?, self.user_id)?;

        let base_revision = self.get_server_node(id)?.map_or(0, |n| n.revision);
        let now = now_millis();
        let deleted: Vec<Node> = self
            .live_subtree(&node)?
            .into_iter()
            .map(|n| Node {
                deleted_at: Some(now),
                updated_by: Some(self.user_id),
                updated_at: Some(now),
                ..n
            })
            .collect();

        let mut batch = StoreBatch::new();
        for node in &deleted {
            batch.put_node(node)?;
        }
        self.outbox
            .enqueue_in(Mutation::new(id, base_revision, MutationPayload::DeleteNode), &mut batch)?;
        self.store.commit(batch)?;
        self.outbox.trigger();

        for node in deleted {
            self.publish_local(EventKind::NodeDeleted { node });
        }
        Ok(())
    }

    fn live_subtree(&self, node: &Node) -> SyncResult<Vec<Node>> {
        let mut children: HashMap<NodeId, Vec<Node>> = HashMap::new();
        for candidate in self.store.list_root_nodes(node.root_id)? {
            if let (Some(parent_id), false) = (candidate.parent_id, candidate.is_deleted()) {
                children.entry(parent_id).or_default().push(candidate);
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

    /// Merge a local CRDT delta into the node's document and queue it.
    pub async fn apply_document_update(&self, node_id: NodeId, delta: Vec<u8>) -> SyncResult<Document> {
        self.edit_document(node_id, move |_| Ok(delta)).await
    }

    /// Insert `text` at character `index` of the node's document.
    pub async fn insert_text(&self, node_id: NodeId, index: u32, text: &str) -> SyncResult<Document> {
        self.edit_document(node_id, |state| crdt::insert_text(state, index, text))
            .await
    }

    async fn edit_document<F>(&self, node_id: NodeId, edit: F) -> SyncResult<Document>
    where
        F: FnOnce(&[u8]) -> SyncResult<Vec<u8>>,
    {
        let _guard = self.locks.lock(node_id).await;
        let node = self.live_node(node_id)?;
        check_update(&self.ancestry(&node)?, self.user_id)?;

        let state = self.documents.get_state(node_id)?;
        let delta = edit(&state.state)?;
        let mut batch = StoreBatch::new();
        let document = self
            .documents
            .merge_local(node_id, &delta, self.user_id, &mut batch)?;
        self.outbox.enqueue_in(
            Mutation::new(node_id, 0, MutationPayload::ApplyDocumentUpdate { data: delta }),
            &mut batch,
        )?;
        self.store.commit(batch)?;
        self.outbox.trigger();
        Ok(document)
    }

    // ─── Reactions ────────────────────────────────────────────────────

    /// Queue a reaction; it shows up once the server replicates it.
    pub fn add_reaction(&self, node_id: NodeId, reaction: &str) -> SyncResult<Mutation> {
        self.queue_reaction(node_id, MutationPayload::AddReaction { reaction: reaction.to_string() })
    }

    pub fn remove_reaction(&self, node_id: NodeId, reaction: &str) -> SyncResult<Mutation> {
        self.queue_reaction(node_id, MutationPayload::RemoveReaction { reaction: reaction.to_string() })
    }

    fn queue_reaction(&self, node_id: NodeId, payload: MutationPayload) -> SyncResult<Mutation> {
        let node = self.live_node(node_id)?;
        check_read(&self.ancestry(&node)?, self.user_id)?;
        self.outbox.enqueue(Mutation::new(node_id, 0, payload))
    }

    // ─── Replica maintenance ──────────────────────────────────────────

    /// Recompute the local row from `server` and the pending entries.
    ///
    /// `exclude` is an entry being settled in the same batch; `staged` holds
    /// local rows written earlier in that batch.
    pub(crate) fn rebuild_local(
        &self,
        node_id: NodeId,
        server: Option<Node>,
        exclude: Option<Uuid>,
        staged: &HashMap<NodeId, Node>,
        batch: &mut StoreBatch,
    ) -> SyncResult<Option<Node>> {
        let pending: Vec<Mutation> = self
            .outbox
            .pending_for(node_id)?
            .into_iter()
            .filter(|m| Some(m.local_id) != exclude)
            .collect();
        let base = server.or_else(|| {
            pending.iter().find_map(|m| match &m.payload {
                MutationPayload::CreateNode { node } => Some(node.clone()),
                _ => None,
            })
        });
        let Some(mut node) = base else {
            if let Some(stale) = self.store.get_node(node_id)? {
                batch.delete_node(&stale);
            }
            return Ok(None);
        };

        for mutation in &pending {
            match &mutation.payload {
                MutationPayload::UpdateNode { patch } => match patch.apply_to(&node.attributes) {
                    Ok(attributes) => {
                        node.attributes = attributes;
                        node.revision += 1;
                    }
                    Err(e) => log::warn!("Pending patch #{} no longer applies: {e}", mutation.sequence),
                },
                MutationPayload::DeleteNode if !node.is_deleted() => {
                    node.deleted_at = Some(mutation.created_at);
                }
                _ => {}
            }
        }

        if let (Some(parent_id), false) = (node.parent_id, node.is_deleted()) {
            let parent = match staged.get(&parent_id) {
                Some(parent) => Some(parent.clone()),
                None => self.store.get_node(parent_id)?,
            };
            if let Some(parent) = parent.filter(Node::is_deleted) {
                node.deleted_at = parent.deleted_at;
            }
        }

        batch.put_node(&node)?;
        Ok(Some(node))
    }

    pub(crate) fn live_node(&self, id: NodeId) -> SyncResult<Node> {
        self.store
            .get_node(id)?
            .filter(|n| !n.is_deleted())
            .ok_or_else(|| SyncError::NotFound(format!("node {id}")))
    }

    pub(crate) fn publish_local(&self, kind: EventKind) {
        self.bus.publish(Event::local(self.workspace_id, kind));
    }
}
