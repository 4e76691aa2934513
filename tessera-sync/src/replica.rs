//! Server-driven updates to the client replica: outbox settlement and
//! replication batches.
//!
//! Remote rows are applied idempotently by `(id, revision)`: a row whose
//! revision is not newer than the stored server row is a duplicate or stale
//! and is dropped. The stream cursor is written in the same batch as the
//! rows it covers.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tessera_core::{
    Cursor, Event, EventKind, Mutation, MutationPayload, Node, NodeId, SyncError, SyncResult,
    StreamId,
};

use crate::node_store::NodeStore;
use crate::outbox::MutationSink;
use crate::protocol::{MutationAck, MutationBody, MutationRequest, ReplicationBatch};
use crate::storage::{ServerNodeRow, StoreBatch};

#[async_trait]
impl MutationSink for NodeStore {
    async fn prepare(&self, mutation: &Mutation) -> SyncResult<MutationRequest> {
        let server = self.get_server_node(mutation.node_id)?;
        let base_revision = server.as_ref().map_or(mutation.base_revision, |n| n.revision);
        let body = match &mutation.payload {
            MutationPayload::CreateNode { node } => MutationBody::CreateNode { node: node.clone() },
            MutationPayload::UpdateNode { patch } => {
                // Always send the patch applied to the newest server view.
                let server = server.ok_or_else(|| {
                    SyncError::NotFound(format!("node {} was never confirmed", mutation.node_id))
                })?;
                MutationBody::UpdateNode {
                    attributes: patch.apply_to(&server.attributes)?,
                }
            }
            MutationPayload::DeleteNode => MutationBody::DeleteNode,
            MutationPayload::ApplyDocumentUpdate { data } => {
                MutationBody::ApplyDocumentUpdate { data: data.clone() }
            }
            MutationPayload::AddReaction { reaction } => MutationBody::AddReaction {
                reaction: reaction.clone(),
            },
            MutationPayload::RemoveReaction { reaction } => MutationBody::RemoveReaction {
                reaction: reaction.clone(),
            },
        };
        Ok(MutationRequest {
            local_id: mutation.local_id,
            node_id: mutation.node_id,
            base_revision,
            body,
        })
    }

    async fn on_success(&self, mutation: &Mutation, ack: &MutationAck, mut batch: StoreBatch) -> SyncResult<()> {
        let _guard = self.locks.lock(mutation.node_id).await;
        if affects_node_row(mutation) {
            let server = match &ack.latest {
                Some(latest) => Some(self.stage_server_node(latest, ack.position.unwrap_or(0), &mut batch)?.0),
                None => self.get_server_node(mutation.node_id)?,
            };
            self.rebuild_local(mutation.node_id, server, Some(mutation.local_id), &HashMap::new(), &mut batch)?;
        }
        self.store.commit(batch)?;
        log::debug!("Mutation {} acknowledged", mutation.local_id);
        Ok(())
    }

    async fn on_retry(&self, mutation: &Mutation, latest: &Node, mut batch: StoreBatch) -> SyncResult<()> {
        let _guard = self.locks.lock(mutation.node_id).await;
        if let MutationPayload::UpdateNode { patch } = &mutation.payload {
            if let Err(e) = patch.apply_to(&latest.attributes) {
                // Keep the newer server row so the rollback rebuilds from it.
                let mut server_only = StoreBatch::new();
                self.stage_server_node(latest, 0, &mut server_only)?;
                self.store.commit(server_only)?;
                return Err(e.into());
            }
        }
        let (server, _) = self.stage_server_node(latest, 0, &mut batch)?;
        let rebuilt = self.rebuild_local(mutation.node_id, Some(server), None, &HashMap::new(), &mut batch)?;
        self.store.commit(batch)?;
        if let Some(node) = rebuilt {
            self.publish_local(EventKind::NodeUpdated { node });
        }
        Ok(())
    }

    async fn on_rejected(&self, mutation: &Mutation, mut batch: StoreBatch) -> SyncResult<()> {
        let _guard = self.locks.lock(mutation.node_id).await;
        if !affects_node_row(mutation) {
            if let MutationPayload::ApplyDocumentUpdate { .. } = mutation.payload {
                // Merged deltas cannot be taken back out of the CRDT state.
                log::warn!(
                    "Document update {} on {} was rejected; local content keeps it",
                    mutation.local_id,
                    mutation.node_id
                );
            }
            self.store.commit(batch)?;
            return Ok(());
        }
        let server = self.get_server_node(mutation.node_id)?;
        let rebuilt = self.rebuild_local(mutation.node_id, server, Some(mutation.local_id), &HashMap::new(), &mut batch)?;
        let restored = match (&mutation.payload, &rebuilt) {
            // The local delete cascaded; every descendant goes back to its server row.
            (MutationPayload::DeleteNode, Some(node)) => self.rebuild_descendants(node.clone(), &mut batch)?,
            _ => Vec::new(),
        };
        let mut changed: Vec<Node> = rebuilt.into_iter().collect();
        changed.extend(restored);
        self.store.commit(batch)?;
        for node in changed {
            let kind = if node.is_deleted() {
                EventKind::NodeDeleted { node }
            } else {
                EventKind::NodeUpdated { node }
            };
            self.publish_local(kind);
        }
        Ok(())
    }
}

impl NodeStore {
    /// Apply one replication batch and advance the stream cursor with it.
    ///
    /// Returns the cursor to acknowledge.
    pub async fn apply_batch(&self, replication: &ReplicationBatch) -> SyncResult<u64> {
        let mut batch = StoreBatch::new();
        let events = match replication.stream_id {
            StreamId::Nodes => self.stage_nodes(replication, &mut batch).await?,
            StreamId::Documents => self.stage_documents(replication, &mut batch).await?,
            StreamId::Reactions => self.stage_reactions(replication, &mut batch)?,
        };

        let mut cursor = self
            .store
            .get_cursor(self.device_id, replication.stream_id)?
            .unwrap_or_else(|| Cursor::new(self.device_id, replication.stream_id));
        cursor.advance(replication.cursor);
        batch.put_cursor(&cursor);
        self.store.commit(batch)?;

        log::debug!(
            "Applied {} {} entries, cursor {}",
            replication.entries.len(),
            replication.stream_id.as_str(),
            cursor.position
        );
        for event in events {
            self.bus.publish(event);
        }
        Ok(cursor.position)
    }

    /// Cursor this device has durably applied on `stream`.
    pub fn cursor(&self, stream: StreamId) -> SyncResult<u64> {
        Ok(self
            .store
            .get_cursor(self.device_id, stream)?
            .map_or(0, |c| c.position))
    }

    async fn stage_nodes(&self, replication: &ReplicationBatch, batch: &mut StoreBatch) -> SyncResult<Vec<Event>> {
        let mut incoming = Vec::with_capacity(replication.entries.len());
        for entry in &replication.entries {
            incoming.push((entry.position, entry.node()?));
        }
        let _guards = self.locks.lock_all(incoming.iter().map(|(_, node)| node.id)).await;

        let mut staged: HashMap<NodeId, Node> = HashMap::new();
        let mut events = Vec::new();
        for (position, node) in incoming {
            let (server, fresh) = self.stage_server_node(&node, position, batch)?;
            if !fresh {
                log::trace!("Skipping stale {} at revision {}", node.id, node.revision);
                continue;
            }
            let before = match staged.get(&node.id) {
                Some(node) => Some(node.clone()),
                None => self.store.get_node(node.id)?,
            };
            let Some(local) = self.rebuild_local(node.id, Some(server), None, &staged, batch)? else {
                continue;
            };
            let kind = match before {
                _ if local.is_deleted() => EventKind::NodeDeleted { node: local.clone() },
                None => EventKind::NodeCreated { node: local.clone() },
                Some(_) => EventKind::NodeUpdated { node: local.clone() },
            };
            events.push(Event::at(self.workspace_id, position, kind));
            staged.insert(local.id, local);
        }
        Ok(events)
    }

    async fn stage_documents(&self, replication: &ReplicationBatch, batch: &mut StoreBatch) -> SyncResult<Vec<Event>> {
        let mut updates = Vec::with_capacity(replication.entries.len());
        for entry in &replication.entries {
            updates.push(entry.document_update()?);
        }
        let _guards = self.locks.lock_all(updates.iter().map(|u| u.document_id)).await;

        let applied = self.documents.merge_remote(&updates, batch)?;
        let mut events = Vec::with_capacity(applied.len());
        for update in applied {
            let root_id = self
                .store
                .get_node(update.document_id)?
                .map_or(update.document_id, |n| n.root_id);
            events.push(Event::at(
                self.workspace_id,
                update.id,
                EventKind::DocumentUpdated { root_id, update },
            ));
        }
        Ok(events)
    }

    fn stage_reactions(&self, replication: &ReplicationBatch, batch: &mut StoreBatch) -> SyncResult<Vec<Event>> {
        let mut events = Vec::with_capacity(replication.entries.len());
        for entry in &replication.entries {
            let reaction = entry.reaction()?;
            batch.put_reaction(&reaction)?;
            let kind = if reaction.deleted_at.is_some() {
                EventKind::ReactionDeleted { reaction }
            } else {
                EventKind::ReactionCreated { reaction }
            };
            events.push(Event::at(self.workspace_id, entry.position, kind));
        }
        Ok(events)
    }

    /// Rebuild every local descendant of `node`, parents before children.
    fn rebuild_descendants(&self, node: Node, batch: &mut StoreBatch) -> SyncResult<Vec<Node>> {
        let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for candidate in self.store.list_root_nodes(node.root_id)? {
            if let Some(parent_id) = candidate.parent_id {
                children.entry(parent_id).or_default().push(candidate.id);
            }
        }

        let mut queue = VecDeque::from([node.id]);
        let mut staged = HashMap::from([(node.id, node)]);
        let mut rebuilt = Vec::new();
        while let Some(id) = queue.pop_front() {
            for child_id in children.remove(&id).unwrap_or_default() {
                if staged.contains_key(&child_id) {
                    continue;
                }
                let server = self.get_server_node(child_id)?;
                if let Some(child) = self.rebuild_local(child_id, server, None, &staged, batch)? {
                    queue.push_back(child_id);
                    staged.insert(child_id, child.clone());
                    rebuilt.push(child);
                }
            }
        }
        Ok(rebuilt)
    }

    /// Stage `node` as the server row unless the stored one is as new.
    ///
    /// Returns the resulting server view and whether `node` was staged.
    fn stage_server_node(&self, node: &Node, position: u64, batch: &mut StoreBatch) -> SyncResult<(Node, bool)> {
        if let Some(existing) = self.store.get_server_node(node.id)? {
            if existing.node.revision >= node.revision {
                return Ok((existing.node, false));
            }
        }
        batch.put_server_node(&ServerNodeRow {
            node: node.clone(),
            position,
        })?;
        Ok((node.clone(), true))
    }
}

fn affects_node_row(mutation: &Mutation) -> bool {
    matches!(
        mutation.payload,
        MutationPayload::CreateNode { .. } | MutationPayload::UpdateNode { .. } | MutationPayload::DeleteNode
    )
}
