//! Relay wire protocol — events exchanged between a session and the relay
//!
//! Every event names the channel it belongs to. Relayed payloads are carried
//! as opaque JSON values: the relay never looks inside them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Events a client sends to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Create a brand-new channel and become its first member
    CreateChannel { id: String },
    /// Join an existing channel (or an empty one, which is then created)
    JoinChannel { id: String },
    /// Leave a channel
    LeaveChannel { id: String },
    /// Forward an opaque payload to the other member of the channel
    Message { id: String, message: Value },
    /// Liveness heartbeat, relayed like `Message`
    Ping { id: String, message: Value },
}

/// Events the relay sends to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// The channel was created with the caller as its only member
    ChannelCreated { id: String },
    /// Both members are present
    ClientsConnected { id: String },
    /// A member left or dropped
    ClientsDisconnected { id: String },
    /// The channel is waiting for its second member
    ClientsWaitingToJoin { id: String, count: usize },
    /// Payload relayed from the other member
    Message { id: String, message: Value },
    /// Heartbeat relayed from the other member
    Ping { id: String, message: Value },
    /// The relay rejected a channel operation
    Error { id: String, error: RelayErrorKind },
}

/// Channel operations the relay can reject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayErrorKind {
    #[error("Channel id is not a valid identifier")]
    InvalidChannelId,
    #[error("Channel already exists")]
    ChannelAlreadyExists,
    #[error("Channel is full")]
    ChannelFull,
}

/// Relay event serialization errors
#[derive(Debug, Error)]
pub enum RelayProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl ClientEvent {
    /// Serialize to the JSON text frame sent over the socket
    pub fn to_json(&self) -> Result<String, RelayProtocolError> {
        serde_json::to_string(self).map_err(|e| RelayProtocolError::SerializationError(e.to_string()))
    }

    /// Parse a JSON text frame
    pub fn from_json(text: &str) -> Result<Self, RelayProtocolError> {
        serde_json::from_str(text).map_err(|e| RelayProtocolError::DeserializationError(e.to_string()))
    }

    /// Channel this event targets
    pub fn channel_id(&self) -> &str {
        match self {
            ClientEvent::CreateChannel { id }
            | ClientEvent::JoinChannel { id }
            | ClientEvent::LeaveChannel { id }
            | ClientEvent::Message { id, .. }
            | ClientEvent::Ping { id, .. } => id,
        }
    }

    /// Wire name of the event
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientEvent::CreateChannel { .. } => "create_channel",
            ClientEvent::JoinChannel { .. } => "join_channel",
            ClientEvent::LeaveChannel { .. } => "leave_channel",
            ClientEvent::Message { .. } => "message",
            ClientEvent::Ping { .. } => "ping",
        }
    }
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, RelayProtocolError> {
        serde_json::to_string(self).map_err(|e| RelayProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, RelayProtocolError> {
        serde_json::from_str(text).map_err(|e| RelayProtocolError::DeserializationError(e.to_string()))
    }

    /// Channel this event belongs to
    pub fn channel_id(&self) -> &str {
        match self {
            ServerEvent::ChannelCreated { id }
            | ServerEvent::ClientsConnected { id }
            | ServerEvent::ClientsDisconnected { id }
            | ServerEvent::ClientsWaitingToJoin { id, .. }
            | ServerEvent::Message { id, .. }
            | ServerEvent::Ping { id, .. }
            | ServerEvent::Error { id, .. } => id,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            ServerEvent::ChannelCreated { .. } => "channel_created",
            ServerEvent::ClientsConnected { .. } => "clients_connected",
            ServerEvent::ClientsDisconnected { .. } => "clients_disconnected",
            ServerEvent::ClientsWaitingToJoin { .. } => "clients_waiting_to_join",
            ServerEvent::Message { .. } => "message",
            ServerEvent::Ping { .. } => "ping",
            ServerEvent::Error { .. } => "error",
        }
    }
}

/// Check that a channel id is a UUID in hyphenated form, in either case
pub fn is_valid_channel_id(id: &str) -> bool {
    id.len() == uuid::fmt::Hyphenated::LENGTH && uuid::Uuid::try_parse(id).is_ok()
}

// ============================================================================
// TESTS
// ============================================================================
