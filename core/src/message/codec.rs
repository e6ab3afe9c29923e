// Message codec — canonical JSON with a size limit

use super::types::{ChannelMessage, HANDSHAKE_TYPE_PREFIX, RESERVED_TYPES};
use serde_json::Value;
use thiserror::Error;

/// Maximum encoded message size: 256 KB
/// Applied before encryption and after decryption.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Serialize a message to its canonical text form
pub fn encode(msg: &ChannelMessage) -> Result<String, CodecError> {
    let text = serde_json::to_string(msg).map_err(|e| CodecError::MalformedMessage(e.to_string()))?;

    if text.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge {
            size: text.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    Ok(text)
}

/// Parse a message from text
pub fn decode(text: &str) -> Result<ChannelMessage, CodecError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge {
            size: text.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let value: Value = serde_json::from_str(text).map_err(|e| CodecError::MalformedMessage(e.to_string()))?;
    from_value(value)
}

/// Interpret an already-parsed JSON value as a message.
///
/// A value claiming a reserved type that does not match that type's shape is
/// rejected instead of being passed through as application data.
pub fn from_value(value: Value) -> Result<ChannelMessage, CodecError> {
    let msg: ChannelMessage =
        serde_json::from_value(value).map_err(|e| CodecError::MalformedMessage(e.to_string()))?;

    if let ChannelMessage::Application(ref value) = msg {
        if let Some(kind) = value.get("type").and_then(Value::as_str) {
            if kind.starts_with(HANDSHAKE_TYPE_PREFIX) || RESERVED_TYPES.contains(&kind) {
                return Err(CodecError::MalformedMessage(format!("invalid {} message", kind)));
            }
        }
    }

    Ok(msg)
}
