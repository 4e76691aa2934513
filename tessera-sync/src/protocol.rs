//! Wire protocol between devices and the replication server.
//!
//! Envelope (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┐
//! │ msg_type │ device_id │ payload  │
//! │ 1 byte   │ 16 bytes  │ variable │
//! └──────────┴───────────┴──────────┘
//! ```
//!
//! Payloads that carry node attributes (mutations and their acks) are JSON,
//! since attribute bags are schemaless JSON values. Everything else is
//! bincode. Replication entries carry their own opaque `payload` bytes.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tessera_core::{
    DeviceId, DocumentUpdate, Node, NodeAttributes, NodeId, NodeReaction, StreamId, SyncError,
    UserId, WorkspaceId,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Device introduces itself; first message on a connection
    Hello = 1,
    /// Client → server mutation request
    Mutation = 2,
    /// Server → client mutation outcome
    MutationAck = 3,
    /// Server → client batch of stream entries
    Replication = 4,
    /// Client → server: entries up to a position are durably applied
    CursorAck = 5,
    /// Server → client: a newer connection for this device took over
    Evicted = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub msg_type: MessageType,
    pub device_id: Uuid,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub device_id: DeviceId,
    pub account_id: UserId,
    pub workspace_id: WorkspaceId,
}

/// Change the server should apply, as derived from an outbox entry at send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationBody {
    CreateNode { node: Node },
    /// Full attributes, rebased by the client onto `base_revision`.
    UpdateNode { attributes: NodeAttributes },
    DeleteNode,
    ApplyDocumentUpdate { data: Vec<u8> },
    AddReaction { reaction: String },
    RemoveReaction { reaction: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub local_id: Uuid,
    pub node_id: NodeId,
    pub base_revision: u64,
    pub body: MutationBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Success,
    /// Stale base revision; `latest` carries the current node.
    Retry,
    Unauthorized,
    /// Validation or missing target; final.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationAck {
    pub local_id: Uuid,
    pub status: AckStatus,
    #[serde(default)]
    pub latest: Option<Node>,
    /// Stream position the change was committed at.
    #[serde(default)]
    pub position: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl MutationAck {
    pub fn success(local_id: Uuid, latest: Option<Node>, position: Option<u64>) -> Self {
        Self {
            local_id,
            status: AckStatus::Success,
            latest,
            position,
            error: None,
        }
    }

    pub fn retry(local_id: Uuid, latest: Node) -> Self {
        Self {
            local_id,
            status: AckStatus::Retry,
            latest: Some(latest),
            position: None,
            error: None,
        }
    }

    /// Map a rejection to its ack; transient errors should never get here.
    pub fn rejected(local_id: Uuid, error: &SyncError) -> Self {
        let status = match error {
            SyncError::Unauthorized { .. } => AckStatus::Unauthorized,
            _ => AckStatus::Failed,
        };
        Self {
            local_id,
            status,
            latest: None,
            position: None,
            error: Some(error.to_string()),
        }
    }
}

/// One replicated change.
///
/// | stream    | id          | revision       | payload                    |
/// |-----------|-------------|----------------|----------------------------|
/// | nodes     | node id     | node revision  | `Node` (JSON)              |
/// | documents | document id | update id      | `DocumentUpdate` (bincode) |
/// | reactions | node id     | position       | `NodeReaction` (JSON)      |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationEntry {
    pub id: Uuid,
    pub revision: u64,
    pub position: u64,
    pub payload: Vec<u8>,
}

impl ReplicationEntry {
    pub fn document(update: &DocumentUpdate) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: update.document_id,
            revision: update.id,
            position: update.id,
            payload: encode_bincode(update)?,
        })
    }

    pub fn node(&self) -> Result<Node, ProtocolError> {
        decode_json(&self.payload)
    }

    pub fn document_update(&self) -> Result<DocumentUpdate, ProtocolError> {
        decode_bincode(&self.payload)
    }

    pub fn reaction(&self) -> Result<NodeReaction, ProtocolError> {
        decode_json(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationBatch {
    pub stream_id: StreamId,
    /// Position to acknowledge once every entry is applied.
    pub cursor: u64,
    pub entries: Vec<ReplicationEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorAck {
    pub stream_id: StreamId,
    pub position: u64,
}

/// Device → server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Hello(Hello),
    Mutation(MutationRequest),
    CursorAck(CursorAck),
    Ping,
}

/// Server → device.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    MutationAck(MutationAck),
    Replication(ReplicationBatch),
    Evicted,
    Pong,
}

impl ClientMessage {
    pub fn encode(&self, device_id: DeviceId) -> Result<Vec<u8>, ProtocolError> {
        let (msg_type, payload) = match self {
            ClientMessage::Hello(hello) => (MessageType::Hello, encode_bincode(hello)?),
            ClientMessage::Mutation(request) => (MessageType::Mutation, encode_json(request)?),
            ClientMessage::CursorAck(ack) => (MessageType::CursorAck, encode_bincode(ack)?),
            ClientMessage::Ping => (MessageType::Ping, Vec::new()),
        };
        WireMessage {
            msg_type,
            device_id,
            payload,
        }
        .encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<(DeviceId, Self), ProtocolError> {
        let wire = WireMessage::decode(bytes)?;
        let message = match wire.msg_type {
            MessageType::Hello => ClientMessage::Hello(decode_bincode(&wire.payload)?),
            MessageType::Mutation => ClientMessage::Mutation(decode_json(&wire.payload)?),
            MessageType::CursorAck => ClientMessage::CursorAck(decode_bincode(&wire.payload)?),
            MessageType::Ping => ClientMessage::Ping,
            other => return Err(ProtocolError::UnexpectedMessage(other)),
        };
        Ok((wire.device_id, message))
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let (msg_type, payload) = match self {
            ServerMessage::MutationAck(ack) => (MessageType::MutationAck, encode_json(ack)?),
            ServerMessage::Replication(batch) => (MessageType::Replication, encode_bincode(batch)?),
            ServerMessage::Evicted => (MessageType::Evicted, Vec::new()),
            ServerMessage::Pong => (MessageType::Pong, Vec::new()),
        };
        WireMessage {
            msg_type,
            device_id: Uuid::nil(),
            payload,
        }
        .encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let wire = WireMessage::decode(bytes)?;
        Ok(match wire.msg_type {
            MessageType::MutationAck => ServerMessage::MutationAck(decode_json(&wire.payload)?),
            MessageType::Replication => ServerMessage::Replication(decode_bincode(&wire.payload)?),
            MessageType::Evicted => ServerMessage::Evicted,
            MessageType::Pong => ServerMessage::Pong,
            other => return Err(ProtocolError::UnexpectedMessage(other)),
        })
    }
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_bincode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_bincode(bytes)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    UnexpectedMessage(MessageType),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out waiting for the server")]
    Timeout,
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::ConnectionClosed | ProtocolError::Timeout => SyncError::Network(e.to_string()),
            _ => SyncError::Validation(e.to_string()),
        }
    }
}

pub(crate) fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

pub(crate) fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

pub(crate) fn encode_bincode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

pub(crate) fn decode_bincode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}
