//! Transfer messages
//!
//! Control messages are JSON text carried in non-binary frames. Data blocks
//! are raw bytes carried in `BINARY` frames, prefixed with the session id
//! (4 bytes, little-endian) so a receiver can demultiplex interleaved
//! transfers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::MessageError;

/// Size of the session id prefix on every data block
pub const BLOCK_HEADER_LEN: usize = 4;

/// Control message kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    DirectoryHeader,
    FileHeader,
    DirectoryItemHeader,
    FileEnd,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

pub mod fields {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const TOTAL_SIZE: &str = "total_size";
    pub const TOTAL_BLOCKS: &str = "total_blocks";
    pub const LEAF_PATHS: &str = "leaf_paths";
    pub const TOTAL_PATHS: &str = "total_paths";
    pub const PATH: &str = "path";
}

/// Metadata message: a kind plus named string fields
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl ControlMessage {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    pub fn directory_header(
        id: u32,
        name: &str,
        total_size: u64,
        leaf_paths_json: String,
        total_paths: u32,
    ) -> Self {
        Self::new(MessageKind::DirectoryHeader)
            .with(fields::ID, id)
            .with(fields::NAME, name)
            .with(fields::TOTAL_SIZE, total_size)
            .with(fields::LEAF_PATHS, leaf_paths_json)
            .with(fields::TOTAL_PATHS, total_paths)
    }

    pub fn file_header(id: u32, name: &str, total_size: u64, total_blocks: u64) -> Self {
        Self::new(MessageKind::FileHeader)
            .with(fields::ID, id)
            .with(fields::NAME, name)
            .with(fields::TOTAL_SIZE, total_size)
            .with(fields::TOTAL_BLOCKS, total_blocks)
    }

    pub fn directory_item_header(id: u32, path: &str, total_size: u64, total_blocks: u64) -> Self {
        Self::new(MessageKind::DirectoryItemHeader)
            .with(fields::ID, id)
            .with(fields::PATH, path)
            .with(fields::TOTAL_SIZE, total_size)
            .with(fields::TOTAL_BLOCKS, total_blocks)
    }

    pub fn file_end(id: u32) -> Self {
        Self::new(MessageKind::FileEnd).with(fields::ID, id)
    }

    pub fn get(&self, key: &'static str) -> Result<&str, MessageError> {
        self.fields
            .get(key)
            .map(String::as_str)
            .ok_or(MessageError::MissingField(key))
    }

    /// Parse a numeric field
    pub fn get_u64(&self, key: &'static str) -> Result<u64, MessageError> {
        let value = self.get(key)?;
        value.parse().map_err(|_| MessageError::InvalidField {
            field: key,
            value: value.to_string(),
        })
    }

    pub fn id(&self) -> Result<u32, MessageError> {
        let value = self.get(fields::ID)?;
        value.parse().map_err(|_| MessageError::InvalidField {
            field: fields::ID,
            value: value.to_string(),
        })
    }

    /// Decode the `leaf_paths` JSON array
    pub fn leaf_paths(&self) -> Result<Vec<String>, MessageError> {
        Ok(serde_json::from_str(self.get(fields::LEAF_PATHS)?)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(|e| MessageError::Serialization(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// A chunk of file bytes tagged with its session id
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataBlock {
    pub session_id: u32,
    pub payload: Vec<u8>,
}

impl DataBlock {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.session_id.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MessageError> {
        if data.len() < BLOCK_HEADER_LEN {
            return Err(MessageError::ShortBlock(data.len()));
        }
        let (id, payload) = data.split_at(BLOCK_HEADER_LEN);
        Ok(Self {
            session_id: u32::from_le_bytes([id[0], id[1], id[2], id[3]]),
            payload: payload.to_vec(),
        })
    }
}

/// Anything a transfer session produces
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Control(ControlMessage),
    Block(DataBlock),
}

impl Outbound {
    /// Frames carrying file bytes are flagged binary
    pub fn is_binary(&self) -> bool {
        matches!(self, Outbound::Block(_))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        match self {
            Outbound::Control(msg) => msg.to_bytes(),
            Outbound::Block(block) => Ok(block.to_bytes()),
        }
    }

    /// Rebuild from a decoded frame payload
    pub fn from_frame(data: &[u8], binary: bool) -> Result<Self, MessageError> {
        if binary {
            DataBlock::from_bytes(data).map(Outbound::Block)
        } else {
            ControlMessage::from_bytes(data).map(Outbound::Control)
        }
    }

    pub fn as_control(&self) -> Option<&ControlMessage> {
        match self {
            Outbound::Control(msg) => Some(msg),
            Outbound::Block(_) => None,
        }
    }

    pub fn as_block(&self) -> Option<&DataBlock> {
        match self {
            Outbound::Block(block) => Some(block),
            Outbound::Control(_) => None,
        }
    }
}
