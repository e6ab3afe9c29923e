// Session façade that applications and wallets talk to

pub mod pairing;
pub mod remote;

pub use pairing::PairingPayload;
pub use remote::RemoteCommunication;

use crate::message::{ChannelMessage, OriginatorInfo, WalletInfo};
use crate::transport::{ReconnectPolicy, TransportError};
use serde_json::Value;
use thiserror::Error;

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Label used only in logs
    pub context: String,
    /// Sent to the responder when acting as originator
    pub originator_info: OriginatorInfo,
    /// Sent to the originator when acting as responder
    pub wallet_info: WalletInfo,
    /// Peer public key from a pairing payload, if known
    pub other_public_key: Option<String>,
    pub reconnect_policy: ReconnectPolicy,
    pub max_reconnect_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            context: "pairlink".to_string(),
            originator_info: OriginatorInfo::default(),
            wallet_info: WalletInfo {
                wallet_type: "Pairlink".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            other_public_key: None,
            reconnect_policy: ReconnectPolicy::default(),
            max_reconnect_attempts: 5,
        }
    }
}

/// Events surfaced to the application
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ChannelCreated {
        channel_id: String,
    },
    ClientsWaiting {
        count: usize,
    },
    /// Secure channel up and both sides' metadata exchanged
    ClientsReady {
        is_originator: bool,
        originator_info: Option<OriginatorInfo>,
        wallet_info: Option<WalletInfo>,
    },
    ClientsDisconnected {
        channel_id: String,
    },
    Message(ChannelMessage),
    Ping(Value),
    ReconnectFailed {
        attempts: u32,
    },
}

/// Session errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("Channel already created")]
    ChannelAlreadyCreated,
    #[error("Invalid pairing payload: {0}")]
    InvalidPairingPayload(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
