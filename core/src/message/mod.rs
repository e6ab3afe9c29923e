// Messages peers exchange over a channel

pub mod codec;
pub mod types;

pub use codec::{decode, encode, from_value, CodecError, MAX_MESSAGE_SIZE};
pub use types::{ChannelMessage, ControlMessage, HandshakeMessage, OriginatorInfo, WalletInfo};
