//! Document snapshots, update log and compaction.
//!
//! ```text
//!  server                                   client
//!  ──────                                   ──────
//!  apply_update ─► document_updates (id)    merge_remote(batch) ─► state ⊔ deltas
//!       │                                   merge_local(delta)  ─► state ⊔ delta
//!       ▼                                          │
//!  compact ─► state = snapshot ⊔ updates           ▼
//!             trim ids ≤ min(device cursors)   content = materialize(state)
//! ```
//!
//! Update ids come from the `documents` stream, so an update's id is also
//! its replication position.

use std::collections::BTreeMap;
use std::sync::Arc;
use tessera_core::{
    now_millis, Document, DocumentState, DocumentUpdate, Event, EventBus, EventKind, Node, NodeId,
    StreamId, SyncResult, UserId, WorkspaceId,
};

use crate::crdt;
use crate::locks::EntityLocks;
use crate::storage::{Store, StoreBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactionReport {
    /// Updates folded into the new snapshot.
    pub folded: usize,
    /// Updates deleted from the log.
    pub trimmed: usize,
    /// Snapshot revision after compaction.
    pub revision: u64,
}

pub struct DocumentStore {
    workspace_id: WorkspaceId,
    store: Arc<Store>,
    bus: EventBus,
    locks: EntityLocks,
}

impl DocumentStore {
    pub fn new(workspace_id: WorkspaceId, store: Arc<Store>, bus: EventBus) -> Self {
        Self {
            workspace_id,
            store,
            bus,
            locks: EntityLocks::new(),
        }
    }

    /// Latest snapshot; an empty state when nothing was compacted yet.
    pub fn get_state(&self, document_id: NodeId) -> SyncResult<DocumentState> {
        Ok(self
            .store
            .get_document_state(document_id)?
            .unwrap_or_else(|| DocumentState::empty(document_id)))
    }

    /// Materialized view, if the document was ever written.
    pub fn get_document(&self, document_id: NodeId) -> SyncResult<Option<Document>> {
        Ok(self.store.get_document(document_id)?)
    }

    /// Updates with `id > since_revision`, in id order.
    pub fn list_updates(&self, document_id: NodeId, since_revision: u64) -> SyncResult<Vec<DocumentUpdate>> {
        Ok(self.store.document_updates(document_id, since_revision)?)
    }

    /// Plain text of snapshot plus every retained update.
    pub fn content(&self, document_id: NodeId) -> SyncResult<String> {
        let state = self.get_state(document_id)?;
        let updates = self.list_updates(document_id, state.revision)?;
        let merged = crdt::merge(&state.state, updates.iter().map(|u| u.data.as_slice()))?;
        crdt::materialize(&merged)
    }

    // ─── Server ───────────────────────────────────────────────────────

    /// Append a delta to `document`'s log with a fresh server id.
    pub fn apply_update(&self, document: &Node, delta: Vec<u8>, author_id: UserId) -> SyncResult<DocumentUpdate> {
        self.append_update(document, delta, author_id, |_, _| Ok(()))
    }

    /// `apply_update`, with extra rows committed in the same write.
    pub fn append_update<F>(
        &self,
        document: &Node,
        delta: Vec<u8>,
        author_id: UserId,
        also: F,
    ) -> SyncResult<DocumentUpdate>
    where
        F: FnOnce(&DocumentUpdate, &mut StoreBatch) -> SyncResult<()>,
    {
        crdt::validate_update(&delta)?;
        let update = self.store.commit_stream(StreamId::Documents, |positions, batch| {
            let update = DocumentUpdate {
                id: positions.next(),
                document_id: document.id,
                author_id,
                data: delta,
                applied_at: now_millis(),
            };
            batch.put_document_update(&update)?;
            also(&update, batch)?;
            Ok::<_, tessera_core::SyncError>(update)
        })?;

        log::debug!("Appended update {} to document {}", update.id, document.id);
        self.bus.publish(Event::at(
            self.workspace_id,
            update.id,
            EventKind::DocumentUpdated {
                root_id: document.root_id,
                update: update.clone(),
            },
        ));
        Ok(update)
    }

    /// Fold every retained update into a new snapshot and trim the log up
    /// to the slowest registered device's documents cursor.
    pub async fn compact(&self, document_id: NodeId) -> SyncResult<CompactionReport> {
        let _guard = self.locks.lock(document_id).await;

        let state = self.get_state(document_id)?;
        let updates = self.list_updates(document_id, state.revision)?;
        let retained = self.list_updates(document_id, 0)?;
        let revision = updates.last().map_or(state.revision, |u| u.id);

        let safe = self
            .store
            .list_cursors(StreamId::Documents)?
            .iter()
            .map(|cursor| cursor.position)
            .min()
            .unwrap_or(revision)
            .min(revision);

        let mut batch = StoreBatch::new();
        if let Some(last) = updates.last() {
            let merged = crdt::merge(&state.state, updates.iter().map(|u| u.data.as_slice()))?;
            let content = crdt::materialize(&merged)?;
            batch.put_document_state(&DocumentState {
                node_id: document_id,
                revision,
                state: merged,
            })?;
            let now = now_millis();
            let document = match self.store.get_document(document_id)? {
                Some(existing) => Document {
                    server_revision: revision,
                    content,
                    updated_by: Some(last.author_id),
                    updated_at: Some(now),
                    ..existing
                },
                None => Document {
                    node_id: document_id,
                    local_revision: 0,
                    server_revision: revision,
                    content,
                    created_by: updates[0].author_id,
                    created_at: now,
                    updated_by: Some(last.author_id),
                    updated_at: Some(now),
                },
            };
            batch.put_document(&document)?;
        }

        let mut trimmed = 0;
        for update in retained.iter().filter(|u| u.id <= safe) {
            batch.delete_document_update(document_id, update.id);
            trimmed += 1;
        }
        if batch.is_empty() {
            return Ok(CompactionReport {
                revision,
                ..Default::default()
            });
        }
        self.store.commit(batch)?;

        log::info!(
            "Compacted document {document_id}: folded {} updates at revision {revision}, trimmed {trimmed}",
            updates.len()
        );
        Ok(CompactionReport {
            folded: updates.len(),
            trimmed,
            revision,
        })
    }

    // ─── Client ───────────────────────────────────────────────────────

    /// Stage remote updates into `batch`. Returns the updates that were new.
    ///
    /// Callers hold the per-document lock and commit `batch` themselves.
    pub fn merge_remote(&self, updates: &[DocumentUpdate], batch: &mut StoreBatch) -> SyncResult<Vec<DocumentUpdate>> {
        let mut by_document: BTreeMap<NodeId, Vec<&DocumentUpdate>> = BTreeMap::new();
        for update in updates {
            by_document.entry(update.document_id).or_default().push(update);
        }

        let mut applied = Vec::new();
        for (document_id, updates) in by_document {
            let existing = self.store.get_document(document_id)?;
            let known = existing.as_ref().map_or(0, |d| d.server_revision);
            let fresh: Vec<&DocumentUpdate> = updates.into_iter().filter(|u| u.id > known).collect();
            let Some(last) = fresh.last() else {
                continue;
            };

            let state = self.get_state(document_id)?;
            let merged = crdt::merge(&state.state, fresh.iter().map(|u| u.data.as_slice()))?;
            let content = crdt::materialize(&merged)?;
            let document = match existing {
                Some(existing) => Document {
                    server_revision: last.id,
                    content,
                    updated_by: Some(last.author_id),
                    updated_at: Some(last.applied_at),
                    ..existing
                },
                None => Document {
                    node_id: document_id,
                    local_revision: 0,
                    server_revision: last.id,
                    content,
                    created_by: fresh[0].author_id,
                    created_at: fresh[0].applied_at,
                    updated_by: Some(last.author_id),
                    updated_at: Some(last.applied_at),
                },
            };
            batch.put_document_state(&DocumentState {
                node_id: document_id,
                revision: last.id,
                state: merged,
            })?;
            batch.put_document(&document)?;
            applied.extend(fresh.into_iter().cloned());
        }
        Ok(applied)
    }

    /// Stage a local edit into `batch` and return the new view.
    ///
    /// Callers hold the per-document lock and commit `batch` themselves.
    pub fn merge_local(
        &self,
        document_id: NodeId,
        delta: &[u8],
        author_id: UserId,
        batch: &mut StoreBatch,
    ) -> SyncResult<Document> {
        crdt::validate_update(delta)?;
        let state = self.get_state(document_id)?;
        let merged = crdt::merge(&state.state, [delta])?;
        let content = crdt::materialize(&merged)?;
        let now = now_millis();
        let document = match self.store.get_document(document_id)? {
            Some(existing) => Document {
                local_revision: existing.local_revision + 1,
                content,
                updated_by: Some(author_id),
                updated_at: Some(now),
                ..existing
            },
            None => Document {
                node_id: document_id,
                local_revision: 1,
                server_revision: 0,
                content,
                created_by: author_id,
                created_at: now,
                updated_by: None,
                updated_at: None,
            },
        };
        batch.put_document_state(&DocumentState {
            node_id: document_id,
            revision: state.revision,
            state: merged,
        })?;
        batch.put_document(&document)?;
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use tempfile::TempDir;
    use tessera_core::{Cursor, NodeAttributes, PageAttributes};
    use uuid::Uuid;

    fn setup() -> (DocumentStore, Arc<Store>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
        let documents = DocumentStore::new(Uuid::new_v4(), store.clone(), EventBus::default());
        (documents, store, dir)
    }

    fn page() -> Node {
        let root = Uuid::new_v4();
        Node {
            id: Uuid::new_v4(),
            parent_id: Some(root),
            root_id: root,
            revision: 0,
            attributes: NodeAttributes::Page(PageAttributes {
                name: "Notes".into(),
                avatar: None,
                collaborators: None,
            }),
            created_by: Uuid::new_v4(),
            created_at: 0,
            updated_by: None,
            updated_at: None,
            deleted_at: None,
        }
    }

    /// Append `parts` as successive edits; returns the assigned ids.
    fn write_all(documents: &DocumentStore, node: &Node, parts: &[&str]) -> Vec<u64> {
        let author = Uuid::new_v4();
        parts
            .iter()
            .map(|part| {
                let current = documents.list_updates(node.id, 0).unwrap();
                let state = crdt::merge(&[], current.iter().map(|u| u.data.as_slice())).unwrap();
                let delta = crdt::append_text(&state, part).unwrap();
                documents.apply_update(node, delta, author).unwrap().id
            })
            .collect()
    }

    #[test]
    fn test_update_ids_are_monotonic() {
        let (documents, _store, _dir) = setup();
        let a = page();
        let b = page();
        let ids_a = write_all(&documents, &a, &["one", "two"]);
        let ids_b = write_all(&documents, &b, &["x"]);
        assert_eq!(ids_a, vec![1, 2]);
        assert_eq!(ids_b, vec![3]);
        assert_eq!(documents.list_updates(a.id, 1).unwrap().len(), 1);
        assert_eq!(documents.content(a.id).unwrap(), "onetwo");
    }

    #[test]
    fn test_invalid_delta_rejected_without_consuming_an_id() {
        let (documents, store, _dir) = setup();
        let node = page();
        assert!(documents.apply_update(&node, vec![0xff], Uuid::new_v4()).is_err());
        assert_eq!(store.stream_head(StreamId::Documents), 0);
    }

    #[test]
    fn test_apply_update_publishes_positioned_event() {
        let (documents, _store, _dir) = setup();
        let node = page();
        let mut events = documents.bus.stream();
        write_all(&documents, &node, &["hi"]);
        let event = events.try_recv().unwrap();
        assert_eq!(event.position, Some(1));
        assert!(matches!(&event.kind, EventKind::DocumentUpdated { root_id, .. } if *root_id == node.root_id));
    }

    #[tokio::test]
    async fn test_compaction_respects_slowest_cursor() {
        let (documents, store, _dir) = setup();
        let node = page();
        write_all(&documents, &node, &["a", "b", "c", "d", "e"]);

        let mut batch = StoreBatch::new();
        batch.put_cursor(&Cursor { device_id: Uuid::new_v4(), stream_id: StreamId::Documents, position: 2 });
        batch.put_cursor(&Cursor { device_id: Uuid::new_v4(), stream_id: StreamId::Documents, position: 5 });
        store.commit(batch).unwrap();

        let report = documents.compact(node.id).await.unwrap();
        assert_eq!(report, CompactionReport { folded: 5, trimmed: 2, revision: 5 });

        let remaining: Vec<u64> = documents.list_updates(node.id, 0).unwrap().iter().map(|u| u.id).collect();
        assert_eq!(remaining, vec![3, 4, 5]);
        assert_eq!(documents.get_state(node.id).unwrap().revision, 5);
        assert_eq!(documents.content(node.id).unwrap(), "abcde");
        assert_eq!(documents.get_document(node.id).unwrap().unwrap().content, "abcde");
    }

    #[tokio::test]
    async fn test_compaction_trims_once_lagging_cursor_advances() {
        let (documents, store, _dir) = setup();
        let node = page();
        write_all(&documents, &node, &["a", "b", "c"]);
        let lagging = Cursor { device_id: Uuid::new_v4(), stream_id: StreamId::Documents, position: 0 };
        let mut batch = StoreBatch::new();
        batch.put_cursor(&lagging);
        store.commit(batch).unwrap();

        let first = documents.compact(node.id).await.unwrap();
        assert_eq!((first.folded, first.trimmed), (3, 0));

        let mut batch = StoreBatch::new();
        batch.put_cursor(&Cursor { position: 3, ..lagging });
        store.commit(batch).unwrap();
        let second = documents.compact(node.id).await.unwrap();
        assert_eq!((second.folded, second.trimmed), (0, 3));
        assert!(documents.list_updates(node.id, 0).unwrap().is_empty());
        assert_eq!(documents.content(node.id).unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_compaction_then_new_updates_reproduce_content() {
        let (documents, _store, _dir) = setup();
        let node = page();
        write_all(&documents, &node, &["abc"]);
        documents.compact(node.id).await.unwrap();

        let state = documents.get_state(node.id).unwrap();
        let delta = crdt::append_text(&state.state, "def").unwrap();
        documents.apply_update(&node, delta, Uuid::new_v4()).unwrap();

        let tail = documents.list_updates(node.id, state.revision).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(documents.content(node.id).unwrap(), "abcdef");
    }

    #[test]
    fn test_client_merges_are_idempotent() {
        let (documents, store, _dir) = setup();
        let doc_id = Uuid::new_v4();
        let update = DocumentUpdate {
            id: 7,
            document_id: doc_id,
            author_id: Uuid::new_v4(),
            data: crdt::append_text(&[], "remote").unwrap(),
            applied_at: 5,
        };

        let mut batch = StoreBatch::new();
        let applied = documents.merge_remote(std::slice::from_ref(&update), &mut batch).unwrap();
        store.commit(batch).unwrap();
        assert_eq!(applied.len(), 1);

        let mut batch = StoreBatch::new();
        let applied = documents.merge_remote(&[update], &mut batch).unwrap();
        assert!(applied.is_empty());
        assert!(batch.is_empty());

        let doc = documents.get_document(doc_id).unwrap().unwrap();
        assert_eq!(doc.content, "remote");
        assert_eq!(doc.server_revision, 7);
    }

    #[test]
    fn test_local_edit_bumps_local_revision() {
        let (documents, store, _dir) = setup();
        let doc_id = Uuid::new_v4();
        let author = Uuid::new_v4();
        let mut batch = StoreBatch::new();
        let delta = crdt::append_text(&[], "draft").unwrap();
        let doc = documents.merge_local(doc_id, &delta, author, &mut batch).unwrap();
        store.commit(batch).unwrap();
        assert_eq!(doc.local_revision, 1);
        assert_eq!(doc.server_revision, 0);
        assert_eq!(documents.get_document(doc_id).unwrap().unwrap().content, "draft");
    }
}
