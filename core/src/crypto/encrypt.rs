// Session encryption: ephemeral X25519 + Blake3 KDF + XChaCha20-Poly1305
//
// Flow:
// 1. Each session generates a fresh X25519 key pair at construction
// 2. Public keys travel (hex encoded) in the handshake messages
// 3. ECDH: my_secret × peer_public → shared_secret
// 4. KDF: Blake3::derive_key(shared_secret || sorted public keys) → symmetric_key
// 5. Encrypt: XChaCha20-Poly1305(symmetric_key, random_nonce, plaintext)
// 6. Output: hex(nonce || ciphertext || tag), a single opaque string
//
// Both peers sort the public keys before hashing, so they derive the same key
// no matter which side computes first.

use super::CryptoError;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// KDF context string for deriving session keys from ECDH shared secrets.
/// Changing this breaks compatibility with every deployed peer.
const KDF_CONTEXT: &str = "pairlink v1 channel session key 2026-10-01";

/// XChaCha20 nonce length
const NONCE_LEN: usize = 24;

/// Poly1305 tag length
const TAG_LEN: usize = 16;

/// Ephemeral X25519 key pair owned by one session.
///
/// The private half never leaves this struct; only the hex public key is
/// ever handed out.
pub struct SessionKeyPair {
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl SessionKeyPair {
    /// Generate a fresh key pair from the OS random source
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public key as 64 lowercase hex characters
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    /// Derive the symmetric session key shared with `peer_public_hex`.
    pub fn derive_shared_key(&self, peer_public_hex: &str) -> Result<SharedKey, CryptoError> {
        let peer_public = parse_public_key(peer_public_hex)?;
        let shared = self.secret.diffie_hellman(&peer_public);

        // Low-order peer points yield an all-zero secret
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }

        let (first, second) = if self.public.as_bytes() <= peer_public.as_bytes() {
            (self.public.as_bytes(), peer_public.as_bytes())
        } else {
            (peer_public.as_bytes(), self.public.as_bytes())
        };

        let mut material = [0u8; 96];
        material[..32].copy_from_slice(shared.as_bytes());
        material[32..64].copy_from_slice(first);
        material[64..].copy_from_slice(second);

        let key = blake3::derive_key(KDF_CONTEXT, &material);
        material.zeroize();

        Ok(SharedKey(key))
    }
}

impl std::fmt::Debug for SessionKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeyPair")
            .field("public", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Parse a hex encoded X25519 public key
pub fn parse_public_key(hex_key: &str) -> Result<X25519PublicKey, CryptoError> {
    let bytes = hex::decode(hex_key).map_err(|_| CryptoError::InvalidPublicKey)?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    Ok(X25519PublicKey::from(bytes))
}

/// Symmetric key shared by the two members of a channel
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; 32]);

impl SharedKey {
    /// Encrypt `plaintext` into an opaque hex string
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let cipher = XChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    /// Decrypt a string produced by [`SharedKey::encrypt`]
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, CryptoError> {
        let raw = hex::decode(encoded).map_err(|_| CryptoError::MalformedCiphertext)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::MalformedCiphertext);
        }

        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        cipher
            .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Short, non-secret identifier of this key, safe to log
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        hex::encode(&hash.as_bytes()[..8])
    }
}

impl PartialEq for SharedKey {
    fn eq(&self, other: &Self) -> bool {
        // Compare digests rather than raw key bytes
        blake3::hash(&self.0) == blake3::hash(&other.0)
    }
}

impl Eq for SharedKey {}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedKey({})", self.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pair() -> (SharedKey, SharedKey) {
        let alice = SessionKeyPair::generate();
        let bob = SessionKeyPair::generate();
        let a = alice
            .derive_shared_key(&bob.public_key_hex())
            .expect("Failed to derive");
        let b = bob
            .derive_shared_key(&alice.public_key_hex())
            .expect("Failed to derive");
        (a, b)
    }

    #[test]
    fn test_both_sides_derive_same_key() {
        let (a, b) = pair();
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_public_key_hex_format() {
        let keys = SessionKeyPair::generate();
        let hex_key = keys.public_key_hex();
        assert_eq!(hex_key.len(), 64);
        assert!(hex_key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let (a, b) = pair();
        let encrypted = a.encrypt(b"hello wallet").expect("Failed to encrypt");
        let decrypted = b.decrypt(&encrypted).expect("Failed to decrypt");
        assert_eq!(decrypted, b"hello wallet");
    }

    #[test]
    fn test_ciphertext_differs_each_time() {
        let (a, _) = pair();
        let first = a.encrypt(b"same").unwrap();
        let second = a.encrypt(b"same").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_wrong_key_fails() {
        let (a, _) = pair();
        let (other, _) = pair();
        let encrypted = a.encrypt(b"secret").unwrap();
        assert!(matches!(other.decrypt(&encrypted), Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (a, b) = pair();
        let mut encrypted = a.encrypt(b"secret").unwrap().into_bytes();
        let last = encrypted.len() - 1;
        encrypted[last] = if encrypted[last] == b'0' { b'1' } else { b'0' };
        let tampered = String::from_utf8(encrypted).unwrap();

        assert!(matches!(b.decrypt(&tampered), Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_malformed_ciphertext() {
        let (a, _) = pair();
        assert!(matches!(a.decrypt("zz"), Err(CryptoError::MalformedCiphertext)));
        assert!(matches!(a.decrypt("00ff"), Err(CryptoError::MalformedCiphertext)));
    }

    #[test]
    fn test_invalid_public_key() {
        let keys = SessionKeyPair::generate();
        assert!(matches!(
            keys.derive_shared_key("abcd"),
            Err(CryptoError::InvalidPublicKey)
        ));
        // All-zero point is low order
        assert!(matches!(
            keys.derive_shared_key(&"00".repeat(32)),
            Err(CryptoError::InvalidPublicKey)
        ));
    }

    proptest! {
        #[test]
        fn prop_decrypt_inverts_encrypt(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let (a, b) = pair();
            let encrypted = a.encrypt(&payload).unwrap();
            prop_assert_eq!(b.decrypt(&encrypted).unwrap(), payload);
        }
    }
}
