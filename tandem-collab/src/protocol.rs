//! Peer-to-peer sync messages.
//!
//! Wire format (bincode-encoded, one message per transport frame):
//! ```text
//! ┌──────────┬──────────────────┬──────────────────┬─────────────────────┐
//! │ kind     │ content          │ sequence_id      │ updates             │
//! │ 1 byte   │ Option<String>   │ Option<u64>      │ Vec<yrs update v1>  │
//! └──────────┴──────────────────┴──────────────────┴─────────────────────┘
//! ```
//!
//! `FullSync` is sent by both ends when a link opens and carries the whole
//! document state. `Update` carries the local deltas coalesced since the last
//! emission. `Ack` echoes an `Update`'s sequence id back on the same link.
//! `content` is the sender's plain text at send time, kept for diagnostics;
//! convergence is driven by `updates` alone.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Whole-document handshake on link open
    FullSync = 1,
    /// Debounced local changes
    Update = 2,
    /// Receipt of an update
    Ack = 3,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub kind: MessageKind,
    pub content: Option<String>,
    pub sequence_id: Option<u64>,
    pub updates: Vec<Vec<u8>>,
}

impl SyncMessage {
    /// Handshake message carrying the sender's text and full CRDT state.
    pub fn full_sync(content: impl Into<String>, snapshot: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::FullSync,
            content: Some(content.into()),
            sequence_id: None,
            updates: vec![snapshot],
        }
    }

    pub fn update(sequence_id: u64, content: impl Into<String>, updates: Vec<Vec<u8>>) -> Self {
        Self {
            kind: MessageKind::Update,
            content: Some(content.into()),
            sequence_id: Some(sequence_id),
            updates,
        }
    }

    pub fn ack(sequence_id: u64) -> Self {
        Self {
            kind: MessageKind::Ack,
            content: None,
            sequence_id: Some(sequence_id),
            updates: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize and validate a frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, read): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::TrailingBytes(bytes.len() - read));
        }
        msg.validate()?;
        Ok(msg)
    }

    /// Check that the fields required by `kind` are present.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let ok = match self.kind {
            MessageKind::FullSync => self.content.is_some() && self.updates.len() == 1,
            MessageKind::Update => self.sequence_id.is_some() && !self.updates.is_empty(),
            MessageKind::Ack => self.sequence_id.is_some(),
        };
        if ok {
            Ok(())
        } else {
            Err(ProtocolError::Malformed(self.kind))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("malformed {0:?} message")]
    Malformed(MessageKind),
}
