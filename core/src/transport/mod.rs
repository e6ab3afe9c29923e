// Secure Transport between a session and the relay

pub mod focus;
pub mod socket;

pub use focus::{AlwaysFocused, HostFocus, ReconnectPolicy};
pub use socket::SocketService;

use crate::crypto::{CryptoError, HandshakeError, HandshakeState};
use crate::message::{ChannelMessage, CodecError};
use crate::relay::{LinkError, RelayErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Which side of the pairing this session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Created the channel
    Originator,
    /// Joined a channel created by the other side
    Responder,
}

/// A freshly created channel, to be shared out of band
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub channel_id: String,
    pub public_key: String,
}

/// Options for a [`SocketService`]
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Label used only in logs
    pub context: String,
    /// Peer public key known from the pairing payload
    pub other_public_key: Option<String>,
    pub reconnect_policy: ReconnectPolicy,
    /// Consecutive failed reconnects before giving up
    pub max_reconnect_attempts: u32,
    /// Base delay for reconnect backoff
    pub reconnect_interval: std::time::Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            context: "pairlink".to_string(),
            other_public_key: None,
            reconnect_policy: ReconnectPolicy::default(),
            max_reconnect_attempts: 5,
            reconnect_interval: std::time::Duration::from_secs(1),
        }
    }
}

/// What the transport reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ChannelCreated { channel_id: String },
    ClientsWaiting { count: usize },
    ClientsConnected { channel_id: String },
    /// The key exchange completed
    KeysExchanged { is_originator: bool },
    ClientsDisconnected { channel_id: String },
    /// A decrypted message from the peer
    Message(ChannelMessage),
    Ping(Value),
    /// Reconnecting was abandoned after this many attempts
    ReconnectFailed { attempts: u32 },
}

/// Secure Transport errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("Channel not created")]
    ChannelNotCreated,
    #[error("Keys not exchanged")]
    KeysNotExchanged,
    #[error("Wrong handshake step: received {received} in state {state}")]
    WrongHandshakeStep {
        state: HandshakeState,
        received: &'static str,
    },
    #[error("Handshake failed: {0}")]
    Handshake(HandshakeError),
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Message for channel {received} on channel {expected}")]
    WrongChannel { expected: String, received: String },
    #[error("Relay rejected request: {0}")]
    Relay(RelayErrorKind),
    #[error("Relay link error: {0}")]
    Link(#[from] LinkError),
    #[error("Crypto error: {0}")]
    Crypto(CryptoError),
}

impl From<HandshakeError> for TransportError {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::WrongHandshakeStep { state, received } => {
                TransportError::WrongHandshakeStep { state, received }
            }
            other => TransportError::Handshake(other),
        }
    }
}

impl From<CryptoError> for TransportError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::KeysNotExchanged => TransportError::KeysNotExchanged,
            CryptoError::DecryptionFailed | CryptoError::MalformedCiphertext => {
                TransportError::DecryptionFailed
            }
            other => TransportError::Crypto(other),
        }
    }
}

impl From<CodecError> for TransportError {
    fn from(e: CodecError) -> Self {
        TransportError::MalformedMessage(e.to_string())
    }
}
