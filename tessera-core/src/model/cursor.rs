use serde::{Deserialize, Serialize};
use std::fmt;

use super::DeviceId;

/// Replicated stream a device subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamId {
    Nodes,
    Documents,
    Reactions,
}

impl StreamId {
    pub const ALL: [StreamId; 3] = [StreamId::Nodes, StreamId::Documents, StreamId::Reactions];

    /// Single-byte key prefix used by storage.
    pub fn as_byte(self) -> u8 {
        match self {
            StreamId::Nodes => 1,
            StreamId::Documents => 2,
            StreamId::Reactions => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        StreamId::ALL.into_iter().find(|s| s.as_byte() == byte)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamId::Nodes => "nodes",
            StreamId::Documents => "documents",
            StreamId::Reactions => "reactions",
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable per-device watermark. Positions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub device_id: DeviceId,
    pub stream_id: StreamId,
    pub position: u64,
}

impl Cursor {
    pub fn new(device_id: DeviceId, stream_id: StreamId) -> Self {
        Self {
            device_id,
            stream_id,
            position: 0,
        }
    }

    /// Advance to `position`; returns false for stale or duplicate positions.
    pub fn advance(&mut self, position: u64) -> bool {
        if position <= self.position {
            return false;
        }
        self.position = position;
        true
    }
}
