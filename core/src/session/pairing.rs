// Pairing payload — what the originator shows as a QR code or deep link

use super::SessionError;
use crate::crypto::encrypt::parse_public_key;
use crate::relay::is_valid_channel_id;
use serde::{Deserialize, Serialize};

/// Everything a responder needs to join the originator's channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingPayload {
    pub channel_id: String,
    pub public_key: String,
}

impl PairingPayload {
    pub fn new(channel_id: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            public_key: public_key.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, SessionError> {
        serde_json::to_string(self).map_err(|e| SessionError::InvalidPairingPayload(e.to_string()))
    }

    /// Parse and validate a payload received out of band
    pub fn from_json(text: &str) -> Result<Self, SessionError> {
        let payload: Self =
            serde_json::from_str(text).map_err(|e| SessionError::InvalidPairingPayload(e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if !is_valid_channel_id(&self.channel_id) {
            return Err(SessionError::InvalidPairingPayload(format!(
                "invalid channel id {}",
                self.channel_id
            )));
        }
        parse_public_key(&self.public_key)
            .map_err(|_| SessionError::InvalidPairingPayload("invalid public key".to_string()))?;
        Ok(())
    }

    /// Render as a deep link under `base`, e.g. `pairlink://connect`
    pub fn to_deep_link(&self, base: &str) -> String {
        // Both fields are URL-safe: a UUID and lowercase hex
        format!("{}?channelId={}&pubkey={}", base, self.channel_id, self.public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionKeyPair;

    fn payload() -> PairingPayload {
        PairingPayload::new(
            uuid::Uuid::new_v4().to_string(),
            SessionKeyPair::generate().public_key_hex(),
        )
    }

    #[test]
    fn test_json_shape() {
        let p = payload();
        let json = p.to_json().expect("Failed to serialize");
        assert!(json.contains("\"channelId\""));
        assert!(json.contains("\"publicKey\""));
        assert_eq!(PairingPayload::from_json(&json).expect("Failed to parse"), p);
    }

    #[test]
    fn test_rejects_bad_fields() {
        let mut p = payload();
        p.channel_id = "nope".to_string();
        assert!(PairingPayload::from_json(&p.to_json().unwrap()).is_err());

        let mut p = payload();
        p.public_key = "abc".to_string();
        assert!(PairingPayload::from_json(&p.to_json().unwrap()).is_err());
    }

    #[test]
    fn test_deep_link() {
        let p = payload();
        let link = p.to_deep_link("pairlink://connect");
        assert!(link.starts_with("pairlink://connect?channelId="));
        assert!(link.ends_with(&p.public_key));
    }
}
