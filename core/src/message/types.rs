// Channel message types — everything one session sends to its peer
//
// Handshake messages travel in the clear (there is no key yet to encrypt
// them with). Every other message is serialized, encrypted, and relayed as an
// opaque string.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix shared by every handshake message type
pub const HANDSHAKE_TYPE_PREFIX: &str = "key_handshake";

/// Message types with a fixed meaning on the channel
pub const RESERVED_TYPES: &[&str] = &["originator_info", "wallet_info", "pause", "ready"];

/// Key exchange messages, sent unencrypted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HandshakeMessage {
    /// Opens a handshake, optionally pushing the sender's public key
    #[serde(rename = "key_handshake_SYN")]
    Syn {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pubkey: Option<String>,
    },
    /// Answers a SYN with the responder's public key
    #[serde(rename = "key_handshake_SYNACK")]
    SynAck { pubkey: String },
    /// Completes the handshake
    #[serde(rename = "key_handshake_ACK")]
    Ack,
    /// Asks the originator to restart the handshake from scratch
    #[serde(rename = "key_handshake_start")]
    Start,
}

impl HandshakeMessage {
    /// Wire name of the handshake step
    pub fn step_name(&self) -> &'static str {
        match self {
            HandshakeMessage::Syn { .. } => "key_handshake_SYN",
            HandshakeMessage::SynAck { .. } => "key_handshake_SYNACK",
            HandshakeMessage::Ack => "key_handshake_ACK",
            HandshakeMessage::Start => "key_handshake_start",
        }
    }
}

/// Application-side identity of the originator
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OriginatorInfo {
    pub url: String,
    pub title: String,
}

/// Identity of the responding wallet
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WalletInfo {
    #[serde(rename = "type")]
    pub wallet_type: String,
    pub version: String,
}

/// Session control messages, sent encrypted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    OriginatorInfo {
        #[serde(rename = "originatorInfo")]
        originator_info: OriginatorInfo,
    },
    WalletInfo {
        #[serde(rename = "walletInfo")]
        wallet_info: WalletInfo,
    },
    /// The sender stops listening until it sends `Ready`
    Pause,
    /// The sender is (again) listening
    Ready,
}

/// Any message carried on a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelMessage {
    Handshake(HandshakeMessage),
    Control(ControlMessage),
    /// Opaque application JSON, passed through unchanged
    Application(Value),
}

impl ChannelMessage {
    pub fn is_handshake(&self) -> bool {
        matches!(self, ChannelMessage::Handshake(_))
    }

    /// Value of the `type` field, if there is one
    pub fn message_type(&self) -> Option<&str> {
        match self {
            ChannelMessage::Handshake(msg) => Some(msg.step_name()),
            ChannelMessage::Control(ControlMessage::OriginatorInfo { .. }) => Some("originator_info"),
            ChannelMessage::Control(ControlMessage::WalletInfo { .. }) => Some("wallet_info"),
            ChannelMessage::Control(ControlMessage::Pause) => Some("pause"),
            ChannelMessage::Control(ControlMessage::Ready) => Some("ready"),
            ChannelMessage::Application(value) => value.get("type").and_then(Value::as_str),
        }
    }
}

impl From<HandshakeMessage> for ChannelMessage {
    fn from(msg: HandshakeMessage) -> Self {
        ChannelMessage::Handshake(msg)
    }
}

impl From<ControlMessage> for ChannelMessage {
    fn from(msg: ControlMessage) -> Self {
        ChannelMessage::Control(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handshake_wire_shape() {
        let syn = serde_json::to_value(HandshakeMessage::Syn { pubkey: None }).unwrap();
        assert_eq!(syn, json!({"type": "key_handshake_SYN"}));

        let synack = serde_json::to_value(HandshakeMessage::SynAck {
            pubkey: "ab".to_string(),
        })
        .unwrap();
        assert_eq!(synack, json!({"type": "key_handshake_SYNACK", "pubkey": "ab"}));
    }

    #[test]
    fn test_control_wire_shape() {
        let info = ControlMessage::WalletInfo {
            wallet_info: WalletInfo {
                wallet_type: "Pairlink".to_string(),
                version: "0.1.0".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(info).unwrap(),
            json!({"type": "wallet_info", "walletInfo": {"type": "Pairlink", "version": "0.1.0"}})
        );
    }

    #[test]
    fn test_untagged_dispatch() {
        let msg: ChannelMessage = serde_json::from_value(json!({"type": "key_handshake_ACK"})).unwrap();
        assert_eq!(msg, ChannelMessage::Handshake(HandshakeMessage::Ack));
        assert!(msg.is_handshake());

        let msg: ChannelMessage = serde_json::from_value(json!({"type": "pause"})).unwrap();
        assert_eq!(msg, ChannelMessage::Control(ControlMessage::Pause));

        let msg: ChannelMessage =
            serde_json::from_value(json!({"type": "eth_sign", "params": [1]})).unwrap();
        assert!(matches!(msg, ChannelMessage::Application(_)));
        assert_eq!(msg.message_type(), Some("eth_sign"));
    }
}
