//! # tessera-sync — Replication engine for Tessera workspaces
//!
//! Persists the node tree and its CRDT documents in RocksDB, keeps a
//! device replica consistent with the server, and streams changes to every
//! connected device.
//!
//! ## Architecture
//!
//! ```text
//!  Device                                                     Server
//! ┌──────────────────────────┐      WebSocket       ┌────────────────────────────┐
//! │ NodeStore ─► Outbox ─────┼── MutationRequest ──►│ ReplicationHub             │
//! │   ▲          (EventLoop, │◄─── MutationAck ─────┤   └─► NodeRegistry (CAS)   │
//! │   │           Backoff)   │                      │         │                  │
//! │   └── apply_batch ◄──────┼── ReplicationBatch ──┤ Synchronizer ◄─ EventBus   │
//! │        cursor ack ───────┼──────────────────────►│ (cursor per device/stream) │
//! │ RadarAggregator          │                      │                            │
//! └──────────────────────────┘                      └────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`storage`] — RocksDB column families, atomic batches, stream positions
//! - [`crdt`] — Yrs document helpers
//! - [`node_store`] / [`replica`] — device replica with optimistic edits
//! - [`document_store`] — document snapshots, update log, compaction
//! - [`outbox`] — durable mutation queue
//! - [`registry`] — server-side authority for nodes and reactions
//! - [`synchronizer`] / [`connection`] — per-device replication sessions
//! - [`server`] / [`client`] — WebSocket transport
//! - [`radar`] — unread counters
//! - [`config`] — aggregate configuration

pub mod client;
pub mod config;
pub mod connection;
pub mod crdt;
pub mod document_store;
pub mod locks;
pub mod node_store;
pub mod outbox;
pub mod protocol;
pub mod radar;
pub mod registry;
pub mod replica;
pub mod server;
pub mod storage;
pub mod synchronizer;

// Re-exports for convenience
pub use client::{ClientConfig, ConnectionState, ReplicationClient};
pub use config::SyncConfig;
pub use connection::{Connection, HubConfig, HubStats, ReplicationHub};
pub use document_store::{CompactionReport, DocumentStore};
pub use locks::EntityLocks;
pub use node_store::{NodeStore, UpdateOutcome};
pub use outbox::{DrainReport, MutationOutbox, MutationSink, MutationTransport, OutboxConfig};
pub use protocol::{
    AckStatus, ClientMessage, CursorAck, Hello, MutationAck, MutationBody, MutationRequest,
    ProtocolError, ReplicationBatch, ReplicationEntry, ServerMessage,
};
pub use radar::{AccountRadarData, RadarAggregator, RadarConfig, UnreadState, WorkspaceRadarData};
pub use registry::NodeRegistry;
pub use server::{ReplicationServer, ServerConfig};
pub use storage::{Store, StoreBatch, StoreConfig, StoreError};
pub use synchronizer::{SyncState, Synchronizer};
