// Pairlink Core — pairing and secure channels over an untrusted relay
//
// Two parties that cannot reach each other directly meet on a relay channel,
// agree on a shared key, and from then on the relay only ever carries
// ciphertext it cannot read.

pub mod crypto;
pub mod message;
pub mod relay;
pub mod session;
pub mod transport;

pub use crypto::{CryptoError, HandshakeError, HandshakeState, KeyExchange, SessionKeyPair, SharedKey};
pub use message::{ChannelMessage, CodecError, ControlMessage, HandshakeMessage, OriginatorInfo, WalletInfo};
pub use relay::{
    ChannelStore, ClientEvent, LinkError, LocalRelayLink, RelayErrorKind, RelayLink, RelayServer,
    RelayServerConfig, RelayServerStats, ServerEvent,
};
pub use session::{PairingPayload, RemoteCommunication, SessionConfig, SessionError, SessionEvent};
pub use transport::{
    AlwaysFocused, Channel, HostFocus, ReconnectPolicy, Role, SocketService, TransportError,
    TransportEvent, TransportOptions,
};

/// Current unix time in seconds
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
