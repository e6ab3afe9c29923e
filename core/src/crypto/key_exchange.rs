//! Key Exchange Engine — SYN / SYNACK / ACK handshake over the relay
//!
//! ```text
//!   initiator                         peer
//!   None ── SYN{pubkey?} ──────────▶  None
//!   AwaitSynAck                       AwaitAck     (derives if SYN had a key)
//!               ◀──── SYNACK{pubkey}
//!   Exchanged (derives) ── ACK ────▶  Exchanged
//! ```
//!
//! A message that arrives in the wrong state aborts the attempt. Once the
//! engine is `Exchanged` every further handshake message is ignored, so stale
//! envelopes replayed after a reconnect cannot disturb the session key.

use super::encrypt::{SessionKeyPair, SharedKey};
use super::CryptoError;
use crate::message::HandshakeMessage;
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Handshake progress of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing sent or received yet
    None,
    /// We sent SYN and wait for SYNACK
    AwaitSynAck,
    /// We answered SYN with SYNACK and wait for ACK
    AwaitAck,
    /// Both sides hold the shared key
    Exchanged,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::None => "none",
            HandshakeState::AwaitSynAck => "await_synack",
            HandshakeState::AwaitAck => "await_ack",
            HandshakeState::Exchanged => "exchanged",
        };
        f.write_str(name)
    }
}

/// Handshake errors. Every one of them aborts the current attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("Wrong handshake step: received {received} in state {state}")]
    WrongHandshakeStep {
        state: HandshakeState,
        received: &'static str,
    },
    #[error("Peer public key missing")]
    MissingPublicKey,
    #[error("Peer public key does not match the paired key")]
    PeerKeyMismatch,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Result of feeding one message to the engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Message to send back to the peer, unencrypted
    pub reply: Option<HandshakeMessage>,
    /// True only for the message that completed the exchange
    pub keys_exchanged: bool,
}

/// Per-session handshake state machine and holder of the session key
#[derive(Debug)]
pub struct KeyExchange {
    keys: SessionKeyPair,
    state: HandshakeState,
    send_public_key: bool,
    other_public_key: Option<String>,
    /// The peer key came from the pairing payload and must not change
    pinned: bool,
    shared_key: Option<SharedKey>,
}

impl KeyExchange {
    /// Create an engine with a fresh key pair and no peer key
    pub fn generate(send_public_key: bool) -> Self {
        Self {
            keys: SessionKeyPair::generate(),
            state: HandshakeState::None,
            send_public_key,
            other_public_key: None,
            pinned: false,
            shared_key: None,
        }
    }

    /// Create an engine with a fresh key pair.
    ///
    /// A peer key known up front (from the pairing payload) is pinned and the
    /// shared key is derived immediately.
    pub fn new(other_public_key: Option<&str>, send_public_key: bool) -> Result<Self, CryptoError> {
        let mut engine = Self::generate(send_public_key);
        if let Some(peer) = other_public_key {
            engine.shared_key = Some(engine.keys.derive_shared_key(peer)?);
            engine.other_public_key = Some(peer.to_string());
            engine.pinned = true;
        }
        Ok(engine)
    }

    /// Begin a handshake as the initiator
    pub fn start(&mut self) -> Result<HandshakeMessage, HandshakeError> {
        if self.state != HandshakeState::None {
            return Err(HandshakeError::WrongHandshakeStep {
                state: self.state,
                received: HandshakeMessage::Start.step_name(),
            });
        }

        self.state = HandshakeState::AwaitSynAck;
        debug!("Handshake started");
        Ok(HandshakeMessage::Syn {
            pubkey: self.send_public_key.then(|| self.keys.public_key_hex()),
        })
    }

    /// Process one handshake message from the peer
    pub fn handle(&mut self, msg: &HandshakeMessage) -> Result<HandshakeOutcome, HandshakeError> {
        if self.state == HandshakeState::Exchanged {
            debug!("Ignoring {} after key exchange", msg.step_name());
            return Ok(HandshakeOutcome::default());
        }

        let result = self.step(msg);
        if let Err(e) = &result {
            debug!("Handshake aborted: {}", e);
            self.abort();
        }
        result
    }

    fn step(&mut self, msg: &HandshakeMessage) -> Result<HandshakeOutcome, HandshakeError> {
        match msg {
            HandshakeMessage::Syn { pubkey } => {
                self.expect_state(HandshakeState::None, msg)?;
                if let Some(peer) = pubkey {
                    self.record_peer_key(peer)?;
                }
                self.state = HandshakeState::AwaitAck;
                Ok(HandshakeOutcome {
                    reply: Some(HandshakeMessage::SynAck {
                        pubkey: self.keys.public_key_hex(),
                    }),
                    keys_exchanged: false,
                })
            }
            HandshakeMessage::SynAck { pubkey } => {
                self.expect_state(HandshakeState::AwaitSynAck, msg)?;
                self.record_peer_key(pubkey)?;
                self.state = HandshakeState::Exchanged;
                Ok(HandshakeOutcome {
                    reply: Some(HandshakeMessage::Ack),
                    keys_exchanged: true,
                })
            }
            HandshakeMessage::Ack => {
                self.expect_state(HandshakeState::AwaitAck, msg)?;
                if self.shared_key.is_none() {
                    return Err(HandshakeError::MissingPublicKey);
                }
                self.state = HandshakeState::Exchanged;
                Ok(HandshakeOutcome {
                    reply: None,
                    keys_exchanged: true,
                })
            }
            // Restart requests are a transport decision
            HandshakeMessage::Start => Ok(HandshakeOutcome::default()),
        }
    }

    /// Drop back to `None`, forgetting any peer key learned during the attempt.
    ///
    /// The key pair is kept, so a peer that paired with our public key can
    /// still complete a new handshake.
    pub fn abort(&mut self) {
        self.state = HandshakeState::None;
        if !self.pinned {
            self.other_public_key = None;
            self.shared_key = None;
        }
    }

    fn expect_state(&self, expected: HandshakeState, msg: &HandshakeMessage) -> Result<(), HandshakeError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(HandshakeError::WrongHandshakeStep {
                state: self.state,
                received: msg.step_name(),
            })
        }
    }

    fn record_peer_key(&mut self, peer: &str) -> Result<(), HandshakeError> {
        match &self.other_public_key {
            Some(known) if known == peer && self.shared_key.is_some() => Ok(()),
            Some(_) if self.pinned => Err(HandshakeError::PeerKeyMismatch),
            _ => {
                let key = self.keys.derive_shared_key(peer)?;
                self.other_public_key = Some(peer.to_string());
                self.shared_key = Some(key);
                Ok(())
            }
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn keys_exchanged(&self) -> bool {
        self.state == HandshakeState::Exchanged
    }

    pub fn my_public_key(&self) -> String {
        self.keys.public_key_hex()
    }

    pub fn other_public_key(&self) -> Option<&str> {
        self.other_public_key.as_deref()
    }

    /// Whether the peer key was supplied at construction
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Loggable identifier of the session key, once exchanged
    pub fn shared_key_fingerprint(&self) -> Option<String> {
        self.exchanged_key().ok().map(SharedKey::fingerprint)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        self.exchanged_key()?.encrypt(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, CryptoError> {
        self.exchanged_key()?.decrypt(ciphertext)
    }

    pub(crate) fn shared_key(&self) -> Option<&SharedKey> {
        self.shared_key.as_ref()
    }

    fn exchanged_key(&self) -> Result<&SharedKey, CryptoError> {
        if !self.keys_exchanged() {
            return Err(CryptoError::KeysNotExchanged);
        }
        self.shared_key.as_ref().ok_or(CryptoError::KeysNotExchanged)
    }
}

// ============================================================================
// TESTS
// ============================================================================
