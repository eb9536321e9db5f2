//! Wire protocol for the real-time channel.
//!
//! Events are externally tagged serde enums with kebab-case names, so the
//! same types travel as bincode in binary frames and as JSON in text frames:
//!
//! ```text
//! client → server            server → client
//! ───────────────            ────────────────────────────
//! join-doc                   joined-room   (snapshot)
//! leave-doc                  user-joined / user-left
//! update-doc-client          update-doc-server (delta)
//! ping                       update-doc-ack    (delta)
//!                            server-error / pong
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use scribe_core::Character;

/// Characters committed by one merge pass, as sent to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub doc_id: Uuid,
    /// Document version after the pass.
    pub version: u64,
    pub changes: Vec<Character>,
}

impl Delta {
    pub fn new(doc_id: Uuid, version: u64, changes: Vec<Character>) -> Self {
        Self { doc_id, version, changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinDoc { doc_id: Uuid },
    LeaveDoc { doc_id: Uuid },
    /// With `index`: insert `payload` at that visible offset.
    /// Without: delete the character whose id is `payload`.
    UpdateDocClient {
        doc_id: Uuid,
        payload: String,
        index: Option<usize>,
    },
    Ping,
}

impl ClientEvent {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_binary(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        encode_text(self)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        decode_text(text)
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Snapshot of the visible characters, sent to a joining connection.
    JoinedRoom {
        doc_id: Uuid,
        version: u64,
        characters: Vec<Character>,
    },
    UserJoined { doc_id: Uuid, user_id: String },
    UserLeft { doc_id: Uuid, user_id: String },
    /// Changes made by someone else.
    UpdateDocServer(Delta),
    /// Changes made by this connection's own submission.
    UpdateDocAck(Delta),
    ServerError { message: String },
    Pong,
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::ServerError { message: message.into() }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_binary(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        encode_text(self)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        decode_text(text)
    }
}

/// How a peer frames its messages. Replies mirror the last frame received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Framing {
    #[default]
    Binary,
    Text,
}

fn encode_binary<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_binary<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn encode_text<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_text<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}
