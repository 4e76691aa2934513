//! Persistent storage for both sides of the replication link.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  StoreBatch   ┌──────────────────────────────────────────┐
//! │ NodeStore    │ ────────────► │ Store (RocksDB)                          │
//! │ DocumentStore│               │                                          │
//! │ Outbox       │               │ CF "nodes"            node rows (JSON)   │
//! └──────────────┘               │ CF "root_index"       root → node ids    │
//! ┌──────────────┐ commit_stream │ CF "server_nodes"     confirmed replicas │
//! │ NodeRegistry │ ────────────► │ CF "documents"        materialized docs  │
//! │ (server)     │  positions    │ CF "document_states"  CRDT snapshots LZ4 │
//! └──────────────┘               │ CF "document_updates" deltas LZ4 by id   │
//!                                │ CF "stream_log"       replicated entries │
//!                                │ CF "outbox"           pending mutations  │
//!                                │ CF "cursors"          device watermarks  │
//!                                │ CF "acks" "reactions" "radar" "meta"     │
//!                                └──────────────────────────────────────────┘
//! ```
//!
//! Every multi-row change goes through one `StoreBatch`, so a replicated
//! payload and the cursor that covers it land in the same RocksDB write.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod rocks;

pub use rocks::{
    LogRecord, Positions, RadarKey, RadarKind, ServerNodeRow, Store, StoreBatch, StoreConfig,
    StoreError,
};
