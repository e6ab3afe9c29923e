// Cryptography module: session keys, channel encryption and key exchange

pub mod encrypt;
pub mod key_exchange;

pub use encrypt::{SessionKeyPair, SharedKey};
pub use key_exchange::{HandshakeError, HandshakeOutcome, HandshakeState, KeyExchange};

use thiserror::Error;

/// Errors from key derivation and the channel cipher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("Keys not exchanged")]
    KeysNotExchanged,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Malformed ciphertext")]
    MalformedCiphertext,
}
