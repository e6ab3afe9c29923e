//! Untrusted two-member channel router
//!
//! The relay pairs connections on a shared channel id and forwards opaque
//! payloads between them. It holds no key material and no message history.

pub mod channels;
pub mod link;
pub mod protocol;
pub mod rate_limit;
pub mod server;

pub use channels::{ChannelStore, ConnectionId, JoinOutcome, CHANNEL_CAPACITY};
pub use link::{LinkError, LocalRelayLink, RelayLink};
pub use protocol::{is_valid_channel_id, ClientEvent, RelayErrorKind, RelayProtocolError, ServerEvent};
pub use rate_limit::OriginRateLimiter;
pub use server::{RelayServer, RelayServerConfig, RelayServerStats};
