//! RocksDB-backed replica and log store.
//!
//! Column families:
//! - `nodes`            — Node rows (JSON), keyed by node id
//! - `root_index`       — `<root_id><node_id>` → empty, for subtree scans
//! - `server_nodes`     — Client only: last server-confirmed node + stream position
//! - `documents`        — Materialized document views (bincode)
//! - `document_states`  — CRDT snapshots (LZ4 compressed)
//! - `document_updates` — CRDT deltas keyed by global update id (LZ4 compressed)
//! - `document_index`   — `<doc_id><update_id>` → empty
//! - `stream_log`       — `<stream><position>` → replicated entry
//! - `outbox`           — Pending local mutations (JSON), keyed by sequence
//! - `cursors`          — `<device_id><stream>` → acknowledged position
//! - `acks`             — Server-side mutation dedup by `local_id`
//! - `reactions`        — `<node_id><user_id><reaction>` → reaction (JSON)
//! - `radar`            — Read-state watermarks
//! - `meta`             — Stream heads
//!
//! Performance targets:
//! - Node point lookup (cache hit): <50μs
//! - Stream batch read (50 entries): <1ms
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, SliceTransform,
    WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tessera_core::{
    Cursor, DeviceId, Document, DocumentState, DocumentUpdate, Mutation, Node, NodeId,
    NodeReaction, StreamId, SyncError, UserId, WorkspaceId,
};
use thiserror::Error;
use uuid::Uuid;

const CF_NODES: &str = "nodes";
const CF_ROOT_INDEX: &str = "root_index";
const CF_SERVER_NODES: &str = "server_nodes";
const CF_DOCUMENTS: &str = "documents";
const CF_DOCUMENT_STATES: &str = "document_states";
const CF_DOCUMENT_UPDATES: &str = "document_updates";
const CF_DOCUMENT_INDEX: &str = "document_index";
const CF_STREAM_LOG: &str = "stream_log";
const CF_OUTBOX: &str = "outbox";
const CF_CURSORS: &str = "cursors";
const CF_ACKS: &str = "acks";
const CF_REACTIONS: &str = "reactions";
const CF_RADAR: &str = "radar";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[
    CF_NODES,
    CF_ROOT_INDEX,
    CF_SERVER_NODES,
    CF_DOCUMENTS,
    CF_DOCUMENT_STATES,
    CF_DOCUMENT_UPDATES,
    CF_DOCUMENT_INDEX,
    CF_STREAM_LOG,
    CF_OUTBOX,
    CF_CURSORS,
    CF_ACKS,
    CF_REACTIONS,
    CF_RADAR,
    CF_META,
];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Shared block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tessera_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided (usually temporary) directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("malformed key in column family `{0}`")]
    CorruptKey(&'static str),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            // Unreadable rows mean the replica is corrupt.
            StoreError::Deserialization(_) | StoreError::Compression(_) | StoreError::CorruptKey(_) => {
                SyncError::Fatal(e.to_string())
            }
            StoreError::Database(_) | StoreError::Serialization(_) => SyncError::Storage(e.to_string()),
        }
    }
}

/// Last server-confirmed version of a node, as seen by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerNodeRow {
    pub node: Node,
    /// Stream position the row arrived at; 0 when it came from an ack.
    pub position: u64,
}

/// One entry of a replicated stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub position: u64,
    /// Node id for node and reaction entries.
    pub entity_id: Uuid,
    pub root_id: NodeId,
    pub revision: u64,
    /// JSON body: a `Node` or a `NodeReaction`.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadarKind {
    /// Highest stream position the user has seen under a node.
    Seen = 1,
    /// Last time the node was opened (millis).
    Opened = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadarKey {
    pub account_id: UserId,
    pub workspace_id: WorkspaceId,
    pub kind: RadarKind,
    pub node_id: NodeId,
}

impl RadarKey {
    fn prefix(account_id: UserId, workspace_id: WorkspaceId, kind: RadarKind) -> Vec<u8> {
        let mut key = Vec::with_capacity(49);
        key.extend_from_slice(account_id.as_bytes());
        key.extend_from_slice(workspace_id.as_bytes());
        key.push(kind as u8);
        key
    }

    fn encode(&self) -> Vec<u8> {
        let mut key = Self::prefix(self.account_id, self.workspace_id, self.kind);
        key.extend_from_slice(self.node_id.as_bytes());
        key
    }
}

#[derive(Serialize, Deserialize)]
struct UpdateRow {
    document_id: NodeId,
    author_id: UserId,
    applied_at: u64,
    /// LZ4 compressed delta.
    data: Vec<u8>,
}

enum BatchOp {
    Put {
        cf: &'static str,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: &'static str,
        key: Vec<u8>,
    },
}

/// Collects writes that must land atomically.
#[derive(Default)]
pub struct StoreBatch {
    ops: Vec<BatchOp>,
}

impl StoreBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn put(&mut self, cf: &'static str, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { cf, key, value });
    }

    fn delete(&mut self, cf: &'static str, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete { cf, key });
    }

    /// Write a node row and keep the root index in step.
    pub fn put_node(&mut self, node: &Node) -> Result<(), StoreError> {
        self.put(CF_NODES, node.id.as_bytes().to_vec(), encode_json(node)?);
        self.put(CF_ROOT_INDEX, pair_key(node.root_id, node.id), Vec::new());
        Ok(())
    }

    pub fn delete_node(&mut self, node: &Node) {
        self.delete(CF_NODES, node.id.as_bytes().to_vec());
        self.delete(CF_ROOT_INDEX, pair_key(node.root_id, node.id));
    }

    pub fn put_server_node(&mut self, row: &ServerNodeRow) -> Result<(), StoreError> {
        self.put(CF_SERVER_NODES, row.node.id.as_bytes().to_vec(), encode_json(row)?);
        Ok(())
    }

    pub fn put_document(&mut self, document: &Document) -> Result<(), StoreError> {
        self.put(CF_DOCUMENTS, document.node_id.as_bytes().to_vec(), encode_bincode(document)?);
        Ok(())
    }

    pub fn put_document_state(&mut self, state: &DocumentState) -> Result<(), StoreError> {
        let stored = DocumentState {
            node_id: state.node_id,
            revision: state.revision,
            state: lz4_flex::compress_prepend_size(&state.state),
        };
        self.put(CF_DOCUMENT_STATES, state.node_id.as_bytes().to_vec(), encode_bincode(&stored)?);
        Ok(())
    }

    pub fn put_document_update(&mut self, update: &DocumentUpdate) -> Result<(), StoreError> {
        let row = UpdateRow {
            document_id: update.document_id,
            author_id: update.author_id,
            applied_at: update.applied_at,
            data: lz4_flex::compress_prepend_size(&update.data),
        };
        self.put(CF_DOCUMENT_UPDATES, update.id.to_be_bytes().to_vec(), encode_bincode(&row)?);
        self.put(CF_DOCUMENT_INDEX, id_position_key(update.document_id, update.id), Vec::new());
        Ok(())
    }

    pub fn delete_document_update(&mut self, document_id: NodeId, id: u64) {
        self.delete(CF_DOCUMENT_UPDATES, id.to_be_bytes().to_vec());
        self.delete(CF_DOCUMENT_INDEX, id_position_key(document_id, id));
    }

    pub fn put_log_record(&mut self, stream: StreamId, record: &LogRecord) -> Result<(), StoreError> {
        self.put(CF_STREAM_LOG, stream_key(stream, record.position), encode_bincode(record)?);
        Ok(())
    }

    pub fn put_mutation(&mut self, mutation: &Mutation) -> Result<(), StoreError> {
        self.put(CF_OUTBOX, mutation.sequence.to_be_bytes().to_vec(), encode_json(mutation)?);
        Ok(())
    }

    pub fn delete_mutation(&mut self, sequence: u64) {
        self.delete(CF_OUTBOX, sequence.to_be_bytes().to_vec());
    }

    pub fn put_cursor(&mut self, cursor: &Cursor) {
        self.put(
            CF_CURSORS,
            cursor_key(cursor.device_id, cursor.stream_id),
            cursor.position.to_be_bytes().to_vec(),
        );
    }

    pub fn put_ack(&mut self, local_id: Uuid, ack: Vec<u8>) {
        self.put(CF_ACKS, local_id.as_bytes().to_vec(), ack);
    }

    pub fn put_reaction(&mut self, reaction: &NodeReaction) -> Result<(), StoreError> {
        self.put(
            CF_REACTIONS,
            reaction_key(reaction.node_id, reaction.user_id, &reaction.reaction),
            encode_json(reaction)?,
        );
        Ok(())
    }

    pub fn put_radar(&mut self, key: RadarKey, value: u64) {
        self.put(CF_RADAR, key.encode(), value.to_be_bytes().to_vec());
    }
}

/// Positions handed out inside one `commit_stream` call.
pub struct Positions {
    last: u64,
}

impl Positions {
    pub fn next(&mut self) -> u64 {
        self.last += 1;
        self.last
    }

    pub fn last(&self) -> u64 {
        self.last
    }
}

/// RocksDB store shared by the client replica and the server registry.
pub struct Store {
    /// Single-threaded mode; callers share it through `Arc`.
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Stream heads. Held for the whole allocate-and-commit step so that
    /// positions become visible in order.
    heads: Mutex<BTreeMap<StreamId, u64>>,
}

impl Store {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        let heads = Self::recover_heads(&db)?;
        log::info!("Opened store at {} (heads: {heads:?})", config.path.display());

        Ok(Self {
            db,
            config,
            heads: Mutex::new(heads),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_NODES | CF_SERVER_NODES | CF_DOCUMENTS | CF_ACKS => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_ROOT_INDEX | CF_DOCUMENT_INDEX | CF_REACTIONS => {
                opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(16));
            }
            CF_DOCUMENT_STATES | CF_DOCUMENT_UPDATES => {
                // Payloads are already LZ4 compressed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_STREAM_LOG | CF_OUTBOX => {
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }
        opts
    }

    fn recover_heads(
        db: &DBWithThreadMode<SingleThreaded>,
    ) -> Result<BTreeMap<StreamId, u64>, StoreError> {
        let cf = db
            .cf_handle(CF_META)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_META}' not found")))?;
        let mut heads = BTreeMap::new();
        for stream in StreamId::ALL {
            let head = match db.get_cf(cf, head_key(stream))? {
                Some(bytes) => decode_u64(&bytes, CF_META)?,
                None => 0,
            };
            heads.insert(stream, head);
        }
        Ok(heads)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Apply a batch atomically.
    pub fn commit(&self, batch: StoreBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut write = WriteBatch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put { cf, key, value } => write.put_cf(self.cf(cf)?, key, value),
                BatchOp::Delete { cf, key } => write.delete_cf(self.cf(cf)?, key),
            }
        }
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(write, &write_opts)?;
        Ok(())
    }

    /// Allocate positions on `stream` and commit `build`'s batch with them.
    ///
    /// Allocation and commit happen under one lock, so a reader that sees
    /// position `p` has also seen every position below it.
    pub fn commit_stream<T, E, F>(&self, stream: StreamId, build: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut Positions, &mut StoreBatch) -> Result<T, E>,
    {
        let mut heads = self.lock_heads();
        let head = heads.get(&stream).copied().unwrap_or(0);
        let mut positions = Positions { last: head };
        let mut batch = StoreBatch::new();
        let value = build(&mut positions, &mut batch)?;

        if positions.last != head {
            batch.put(CF_META, head_key(stream), positions.last.to_be_bytes().to_vec());
        }
        self.commit(batch)?;
        heads.insert(stream, positions.last);
        Ok(value)
    }

    /// Highest committed position on `stream`.
    pub fn stream_head(&self, stream: StreamId) -> u64 {
        self.lock_heads().get(&stream).copied().unwrap_or(0)
    }

    fn lock_heads(&self) -> MutexGuard<'_, BTreeMap<StreamId, u64>> {
        self.heads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Nodes ────────────────────────────────────────────────────────

    pub fn get_node(&self, id: NodeId) -> Result<Option<Node>, StoreError> {
        self.get_json(CF_NODES, id.as_bytes())
    }

    /// Every node row under `root_id`, the root included.
    pub fn list_root_nodes(&self, root_id: NodeId) -> Result<Vec<Node>, StoreError> {
        let mut nodes = Vec::new();
        for (key, _) in self.scan_prefix(CF_ROOT_INDEX, root_id.as_bytes())? {
            let node_id = uuid_at(&key, 16, CF_ROOT_INDEX)?;
            if let Some(node) = self.get_node(node_id)? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        self.scan_prefix(CF_NODES, &[])?
            .into_iter()
            .map(|(_, value)| decode_json(&value))
            .collect()
    }

    pub fn get_server_node(&self, id: NodeId) -> Result<Option<ServerNodeRow>, StoreError> {
        self.get_json(CF_SERVER_NODES, id.as_bytes())
    }

    pub fn list_server_nodes(&self) -> Result<Vec<ServerNodeRow>, StoreError> {
        self.scan_prefix(CF_SERVER_NODES, &[])?
            .into_iter()
            .map(|(_, value)| decode_json(&value))
            .collect()
    }

    // ─── Documents ────────────────────────────────────────────────────

    pub fn get_document(&self, id: NodeId) -> Result<Option<Document>, StoreError> {
        match self.db.get_cf(self.cf(CF_DOCUMENTS)?, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_bincode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_document_state(&self, id: NodeId) -> Result<Option<DocumentState>, StoreError> {
        let Some(bytes) = self.db.get_cf(self.cf(CF_DOCUMENT_STATES)?, id.as_bytes())? else {
            return Ok(None);
        };
        let stored: DocumentState = decode_bincode(&bytes)?;
        let state = lz4_flex::decompress_size_prepended(&stored.state)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        Ok(Some(DocumentState { state, ..stored }))
    }

    /// Documents that have a compacted snapshot.
    pub fn list_compacted_documents(&self) -> Result<Vec<NodeId>, StoreError> {
        self.scan_prefix(CF_DOCUMENT_STATES, &[])?
            .into_iter()
            .map(|(key, _)| uuid_at(&key, 0, CF_DOCUMENT_STATES))
            .collect()
    }

    pub fn get_document_update(&self, id: u64) -> Result<Option<DocumentUpdate>, StoreError> {
        match self.db.get_cf(self.cf(CF_DOCUMENT_UPDATES)?, id.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode_update(id, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Updates of one document with `id > after`, in id order.
    pub fn document_updates(&self, document_id: NodeId, after: u64) -> Result<Vec<DocumentUpdate>, StoreError> {
        let mut updates = Vec::new();
        for (key, _) in self.scan_prefix(CF_DOCUMENT_INDEX, document_id.as_bytes())? {
            let id = u64_at(&key, 16, CF_DOCUMENT_INDEX)?;
            if id <= after {
                continue;
            }
            if let Some(update) = self.get_document_update(id)? {
                updates.push(update);
            }
        }
        Ok(updates)
    }

    /// Updates across all documents with `id > after`, at most `limit`.
    pub fn updates_after(&self, after: u64, limit: usize) -> Result<Vec<DocumentUpdate>, StoreError> {
        let cf = self.cf(CF_DOCUMENT_UPDATES)?;
        let start = after.saturating_add(1).to_be_bytes();
        let mut updates = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            if updates.len() >= limit {
                break;
            }
            let (key, value) = item?;
            let id = u64_at(&key, 0, CF_DOCUMENT_UPDATES)?;
            updates.push(decode_update(id, &value)?);
        }
        Ok(updates)
    }

    // ─── Stream Log ───────────────────────────────────────────────────

    /// Entries of `stream` with `position > after`, at most `limit`.
    pub fn read_stream(&self, stream: StreamId, after: u64, limit: usize) -> Result<Vec<LogRecord>, StoreError> {
        let cf = self.cf(CF_STREAM_LOG)?;
        let start = stream_key(stream, after.saturating_add(1));
        let mut records = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            if records.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if key.first() != Some(&stream.as_byte()) {
                break;
            }
            records.push(decode_bincode(&value)?);
        }
        Ok(records)
    }

    // ─── Outbox ───────────────────────────────────────────────────────

    /// All outbox rows in sequence order, failed ones included.
    pub fn list_mutations(&self) -> Result<Vec<Mutation>, StoreError> {
        self.scan_prefix(CF_OUTBOX, &[])?
            .into_iter()
            .map(|(_, value)| decode_json(&value))
            .collect()
    }

    pub fn last_mutation_sequence(&self) -> Result<u64, StoreError> {
        let cf = self.cf(CF_OUTBOX)?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                u64_at(&key, 0, CF_OUTBOX)
            }
            None => Ok(0),
        }
    }

    // ─── Cursors ──────────────────────────────────────────────────────

    pub fn get_cursor(&self, device_id: DeviceId, stream: StreamId) -> Result<Option<Cursor>, StoreError> {
        match self.db.get_cf(self.cf(CF_CURSORS)?, cursor_key(device_id, stream))? {
            Some(bytes) => Ok(Some(Cursor {
                device_id,
                stream_id: stream,
                position: decode_u64(&bytes, CF_CURSORS)?,
            })),
            None => Ok(None),
        }
    }

    /// Every registered device's cursor on `stream`.
    pub fn list_cursors(&self, stream: StreamId) -> Result<Vec<Cursor>, StoreError> {
        let mut cursors = Vec::new();
        for (key, value) in self.scan_prefix(CF_CURSORS, &[])? {
            if key.len() != 17 {
                return Err(StoreError::CorruptKey(CF_CURSORS));
            }
            if key[16] != stream.as_byte() {
                continue;
            }
            cursors.push(Cursor {
                device_id: uuid_at(&key, 0, CF_CURSORS)?,
                stream_id: stream,
                position: decode_u64(&value, CF_CURSORS)?,
            });
        }
        Ok(cursors)
    }

    /// Drop every cursor of a retired device. Returns how many were removed.
    pub fn delete_cursors(&self, device_id: DeviceId) -> Result<usize, StoreError> {
        let mut batch = StoreBatch::new();
        for (key, _) in self.scan_prefix(CF_CURSORS, device_id.as_bytes())? {
            batch.delete(CF_CURSORS, key.to_vec());
        }
        let removed = batch.len();
        self.commit(batch)?;
        Ok(removed)
    }

    // ─── Acks & Reactions ─────────────────────────────────────────────

    pub fn get_ack(&self, local_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get_cf(self.cf(CF_ACKS)?, local_id.as_bytes())?)
    }

    pub fn get_reaction(
        &self,
        node_id: NodeId,
        user_id: UserId,
        reaction: &str,
    ) -> Result<Option<NodeReaction>, StoreError> {
        self.get_json(CF_REACTIONS, &reaction_key(node_id, user_id, reaction))
    }

    pub fn list_reactions(&self, node_id: NodeId) -> Result<Vec<NodeReaction>, StoreError> {
        self.scan_prefix(CF_REACTIONS, node_id.as_bytes())?
            .into_iter()
            .map(|(_, value)| decode_json(&value))
            .collect()
    }

    // ─── Radar ────────────────────────────────────────────────────────

    pub fn get_radar(&self, key: RadarKey) -> Result<Option<u64>, StoreError> {
        match self.db.get_cf(self.cf(CF_RADAR)?, key.encode())? {
            Some(bytes) => Ok(Some(decode_u64(&bytes, CF_RADAR)?)),
            None => Ok(None),
        }
    }

    pub fn list_radar(
        &self,
        account_id: UserId,
        workspace_id: WorkspaceId,
        kind: RadarKind,
    ) -> Result<Vec<(NodeId, u64)>, StoreError> {
        let prefix = RadarKey::prefix(account_id, workspace_id, kind);
        self.scan_prefix(CF_RADAR, &prefix)?
            .into_iter()
            .map(|(key, value)| {
                Ok((uuid_at(&key, prefix.len(), CF_RADAR)?, decode_u64(&value, CF_RADAR)?))
            })
            .collect()
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn get_json<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(decode_json(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let handle = self.cf(cf)?;
        let mode = if prefix.is_empty() {
            IteratorMode::Start
        } else {
            IteratorMode::From(prefix, Direction::Forward)
        };
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(handle, mode) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key, value));
        }
        Ok(rows)
    }
}

fn head_key(stream: StreamId) -> Vec<u8> {
    format!("head/{stream}").into_bytes()
}

fn pair_key(first: Uuid, second: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(first.as_bytes());
    key.extend_from_slice(second.as_bytes());
    key
}

fn id_position_key(id: Uuid, position: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(id.as_bytes());
    key.extend_from_slice(&position.to_be_bytes());
    key
}

fn stream_key(stream: StreamId, position: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(stream.as_byte());
    key.extend_from_slice(&position.to_be_bytes());
    key
}

fn cursor_key(device_id: DeviceId, stream: StreamId) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.extend_from_slice(device_id.as_bytes());
    key.push(stream.as_byte());
    key
}

fn reaction_key(node_id: NodeId, user_id: UserId, reaction: &str) -> Vec<u8> {
    let mut key = pair_key(node_id, user_id);
    key.extend_from_slice(reaction.as_bytes());
    key
}

fn uuid_at(key: &[u8], offset: usize, cf: &'static str) -> Result<Uuid, StoreError> {
    key.get(offset..offset + 16)
        .and_then(|bytes| <[u8; 16]>::try_from(bytes).ok())
        .map(Uuid::from_bytes)
        .ok_or(StoreError::CorruptKey(cf))
}

fn u64_at(key: &[u8], offset: usize, cf: &'static str) -> Result<u64, StoreError> {
    key.get(offset..offset + 8)
        .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
        .map(u64::from_be_bytes)
        .ok_or(StoreError::CorruptKey(cf))
}

fn decode_u64(bytes: &[u8], cf: &'static str) -> Result<u64, StoreError> {
    if bytes.len() != 8 {
        return Err(StoreError::CorruptKey(cf));
    }
    u64_at(bytes, 0, cf)
}

fn decode_update(id: u64, bytes: &[u8]) -> Result<DocumentUpdate, StoreError> {
    let row: UpdateRow = decode_bincode(bytes)?;
    let data = lz4_flex::decompress_size_prepended(&row.data)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    Ok(DocumentUpdate {
        id,
        document_id: row.document_id,
        author_id: row.author_id,
        data,
        applied_at: row.applied_at,
    })
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
}

fn encode_bincode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_bincode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{NodeAttributes, Role, SpaceAttributes};
    use tempfile::TempDir;

    fn open() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(StoreConfig::for_testing(dir.path())).unwrap();
        (store, dir)
    }

    fn space(id: NodeId) -> Node {
        Node {
            id,
            parent_id: None,
            root_id: id,
            revision: 0,
            attributes: NodeAttributes::Space(SpaceAttributes {
                name: "Ops".into(),
                description: None,
                avatar: None,
                collaborators: [(Uuid::new_v4(), Role::Owner)].into_iter().collect(),
            }),
            created_by: Uuid::new_v4(),
            created_at: 1,
            updated_by: None,
            updated_at: None,
            deleted_at: None,
        }
    }

    #[test]
    fn test_store_open_close() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.path(), dir.path());
        assert_eq!(store.stream_head(StreamId::Nodes), 0);
    }

    #[test]
    fn test_node_roundtrip_and_root_index() {
        let (store, _dir) = open();
        let root = space(Uuid::new_v4());
        let mut batch = StoreBatch::new();
        batch.put_node(&root).unwrap();
        store.commit(batch).unwrap();

        assert_eq!(store.get_node(root.id).unwrap(), Some(root.clone()));
        let listed = store.list_root_nodes(root.id).unwrap();
        assert_eq!(listed, vec![root]);
        assert!(store.get_node(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_commit_stream_allocates_in_order() {
        let (store, _dir) = open();
        let first = store
            .commit_stream::<_, StoreError, _>(StreamId::Nodes, |positions, _| {
                Ok((positions.next(), positions.next()))
            })
            .unwrap();
        assert_eq!(first, (1, 2));
        let next = store
            .commit_stream::<_, StoreError, _>(StreamId::Nodes, |positions, _| Ok(positions.next()))
            .unwrap();
        assert_eq!(next, 3);
        // streams are independent
        let docs = store
            .commit_stream::<_, StoreError, _>(StreamId::Documents, |positions, _| Ok(positions.next()))
            .unwrap();
        assert_eq!(docs, 1);
    }

    #[test]
    fn test_failed_build_does_not_advance_head() {
        let (store, _dir) = open();
        let result = store.commit_stream::<(), StoreError, _>(StreamId::Nodes, |positions, _| {
            positions.next();
            Err(StoreError::Serialization("nope".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.stream_head(StreamId::Nodes), 0);
    }

    #[test]
    fn test_heads_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(StoreConfig::for_testing(dir.path())).unwrap();
            store
                .commit_stream::<_, StoreError, _>(StreamId::Reactions, |positions, _| {
                    Ok(positions.next())
                })
                .unwrap();
        }
        let store = Store::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.stream_head(StreamId::Reactions), 1);
    }

    #[test]
    fn test_stream_log_reads_after_position() {
        let (store, _dir) = open();
        let root = Uuid::new_v4();
        store
            .commit_stream::<_, StoreError, _>(StreamId::Nodes, |positions, batch| {
                for _ in 0..5 {
                    let position = positions.next();
                    batch.put_log_record(
                        StreamId::Nodes,
                        &LogRecord {
                            position,
                            entity_id: Uuid::new_v4(),
                            root_id: root,
                            revision: 0,
                            payload: vec![position as u8],
                        },
                    )?;
                }
                Ok(())
            })
            .unwrap();

        let records = store.read_stream(StreamId::Nodes, 2, 2).unwrap();
        let positions: Vec<u64> = records.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![3, 4]);
        assert!(store.read_stream(StreamId::Documents, 0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_document_updates_by_document_and_globally() {
        let (store, _dir) = open();
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let mut batch = StoreBatch::new();
        for (id, doc) in [(1, doc_a), (2, doc_b), (3, doc_a)] {
            batch
                .put_document_update(&DocumentUpdate {
                    id,
                    document_id: doc,
                    author_id: Uuid::new_v4(),
                    data: vec![id as u8; 64],
                    applied_at: 0,
                })
                .unwrap();
        }
        store.commit(batch).unwrap();

        let a: Vec<u64> = store.document_updates(doc_a, 0).unwrap().iter().map(|u| u.id).collect();
        assert_eq!(a, vec![1, 3]);
        assert_eq!(store.document_updates(doc_a, 1).unwrap().len(), 1);
        let all = store.updates_after(1, 10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].data, vec![2u8; 64]);

        let mut trim = StoreBatch::new();
        trim.delete_document_update(doc_a, 1);
        store.commit(trim).unwrap();
        assert_eq!(store.document_updates(doc_a, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_document_state_is_compressed_transparently() {
        let (store, _dir) = open();
        let state = DocumentState {
            node_id: Uuid::new_v4(),
            revision: 9,
            state: vec![7u8; 4096],
        };
        let mut batch = StoreBatch::new();
        batch.put_document_state(&state).unwrap();
        store.commit(batch).unwrap();
        assert_eq!(store.get_document_state(state.node_id).unwrap(), Some(state));
    }

    #[test]
    fn test_cursors_per_device_and_stream() {
        let (store, _dir) = open();
        let d1 = Uuid::new_v4();
        let d2 = Uuid::new_v4();
        let mut batch = StoreBatch::new();
        batch.put_cursor(&Cursor { device_id: d1, stream_id: StreamId::Nodes, position: 4 });
        batch.put_cursor(&Cursor { device_id: d1, stream_id: StreamId::Documents, position: 2 });
        batch.put_cursor(&Cursor { device_id: d2, stream_id: StreamId::Nodes, position: 7 });
        store.commit(batch).unwrap();

        assert_eq!(store.get_cursor(d1, StreamId::Nodes).unwrap().unwrap().position, 4);
        assert_eq!(store.list_cursors(StreamId::Nodes).unwrap().len(), 2);

        assert_eq!(store.delete_cursors(d1).unwrap(), 2);
        assert!(store.get_cursor(d1, StreamId::Nodes).unwrap().is_none());
        assert_eq!(store.list_cursors(StreamId::Nodes).unwrap().len(), 1);
    }

    #[test]
    fn test_radar_rows_scoped_by_kind() {
        let (store, _dir) = open();
        let account = Uuid::new_v4();
        let workspace = Uuid::new_v4();
        let node = Uuid::new_v4();
        let mut batch = StoreBatch::new();
        batch.put_radar(RadarKey { account_id: account, workspace_id: workspace, kind: RadarKind::Seen, node_id: node }, 12);
        batch.put_radar(RadarKey { account_id: account, workspace_id: workspace, kind: RadarKind::Opened, node_id: node }, 99);
        store.commit(batch).unwrap();

        assert_eq!(store.list_radar(account, workspace, RadarKind::Seen).unwrap(), vec![(node, 12)]);
        assert_eq!(store.list_radar(account, workspace, RadarKind::Opened).unwrap(), vec![(node, 99)]);
    }

    #[test]
    fn test_corrupt_rows_map_to_fatal() {
        let err: SyncError = StoreError::Deserialization("bad".into()).into();
        assert!(matches!(err, SyncError::Fatal(_)));
        let err: SyncError = StoreError::Database("io".into()).into();
        assert!(matches!(err, SyncError::Storage(_)));
    }
}
