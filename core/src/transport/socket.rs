//! Secure Transport — one relay connection, one channel, one key exchange
//!
//! `SocketService` is a single-threaded state machine. Its owner feeds it
//! relay events in arrival order through [`SocketService::handle_event`] and
//! gets back the [`TransportEvent`]s they produced. Before the key exchange
//! completes only handshake messages may cross the channel, in the clear.
//! Afterwards every message is encrypted with the session key.

use super::focus::HostFocus;
use super::{Channel, Role, TransportError, TransportEvent, TransportOptions};
use crate::crypto::{HandshakeState, KeyExchange};
use crate::message::{self, ChannelMessage, ControlMessage, HandshakeMessage};
use crate::relay::{ClientEvent, RelayLink, ServerEvent};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest delay between reconnect attempts
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// The Secure Transport
pub struct SocketService {
    link: Box<dyn RelayLink>,
    options: TransportOptions,
    key_exchange: KeyExchange,
    role: Option<Role>,
    channel_id: Option<String>,
    /// Both members are present on the relay
    connected: bool,
    manual_disconnect: bool,
    paused: bool,
    /// Set by resume/reconnect, cleared once `clients_connected` resolves it
    reconnect: bool,
    /// Rejoining after the link dropped on its own; the peer may have moved on
    rejoining_after_loss: bool,
    reconnect_attempts: u32,
    awaiting_focus: bool,
}

impl SocketService {
    pub fn new(link: Box<dyn RelayLink>, options: TransportOptions) -> Result<Self, TransportError> {
        let key_exchange = KeyExchange::new(options.other_public_key.as_deref(), true)?;

        Ok(Self {
            link,
            options,
            key_exchange,
            role: None,
            channel_id: None,
            connected: false,
            manual_disconnect: false,
            paused: false,
            reconnect: false,
            rejoining_after_loss: false,
            reconnect_attempts: 0,
            awaiting_focus: false,
        })
    }

    // ========================================================================
    // CHANNEL LIFECYCLE
    // ========================================================================

    /// Create a new channel as the originator.
    ///
    /// Every call creates a distinct channel; the previous one is left.
    pub fn create_channel(&mut self) -> Result<Channel, TransportError> {
        let channel_id = uuid::Uuid::new_v4().to_string();
        self.recreate_channel(&channel_id)
    }

    /// Create a channel under an id that was already shared out of band.
    ///
    /// Only succeeds on the relay once the previous room under that id is gone.
    pub fn recreate_channel(&mut self, channel_id: &str) -> Result<Channel, TransportError> {
        self.leave_current_channel();
        self.link.connect()?;

        let channel_id = channel_id.to_string();
        self.enter_channel(Role::Originator, &channel_id);
        self.link.emit(ClientEvent::CreateChannel {
            id: channel_id.clone(),
        })?;

        info!("[{}] Created channel {}", self.options.context, channel_id);
        Ok(Channel {
            channel_id,
            public_key: self.key_exchange.my_public_key(),
        })
    }

    /// Join an existing channel as the responder
    pub fn connect_to_channel(&mut self, channel_id: &str) -> Result<(), TransportError> {
        self.leave_current_channel();
        self.link.connect()?;

        self.enter_channel(Role::Responder, channel_id);
        self.link.emit(ClientEvent::JoinChannel {
            id: channel_id.to_string(),
        })?;

        info!("[{}] Joining channel {}", self.options.context, channel_id);
        Ok(())
    }

    fn enter_channel(&mut self, role: Role, channel_id: &str) {
        self.role = Some(role);
        self.channel_id = Some(channel_id.to_string());
        self.connected = false;
        self.manual_disconnect = false;
        self.paused = false;
        self.reconnect = false;
        self.rejoining_after_loss = false;
        self.reconnect_attempts = 0;
        self.awaiting_focus = false;
    }

    fn leave_current_channel(&mut self) {
        if let Some(id) = self.channel_id.clone() {
            if self.link.is_connected() {
                // Best effort; the relay also drops us when the link closes
                let _ = self.link.emit(ClientEvent::LeaveChannel { id });
            }
        }
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    /// Process one relay event
    pub fn handle_event(&mut self, event: ServerEvent) -> Result<Vec<TransportEvent>, TransportError> {
        // Anything from the relay proves the link is healthy
        self.reconnect_attempts = 0;

        let Some(channel_id) = self.channel_id.clone() else {
            debug!("[{}] {} before joining a channel", self.options.context, event.event_name());
            return Ok(Vec::new());
        };

        if event.channel_id() != channel_id {
            if let ServerEvent::Message { id, .. } = event {
                return Err(TransportError::WrongChannel {
                    expected: channel_id,
                    received: id,
                });
            }
            debug!("[{}] Ignoring {} for channel {}", self.options.context, event.event_name(), event.channel_id());
            return Ok(Vec::new());
        }

        match event {
            ServerEvent::ChannelCreated { id } => Ok(vec![TransportEvent::ChannelCreated { channel_id: id }]),
            ServerEvent::ClientsWaitingToJoin { id, count } => Ok(self.on_clients_waiting(id, count)),
            ServerEvent::ClientsConnected { id } => self.on_clients_connected(id),
            ServerEvent::ClientsDisconnected { id } => {
                self.connected = false;
                debug!("[{}] Peer left channel {}", self.options.context, id);
                Ok(vec![TransportEvent::ClientsDisconnected { channel_id: id }])
            }
            ServerEvent::Message { message, .. } => self.on_message(message),
            ServerEvent::Ping { message, .. } => Ok(vec![TransportEvent::Ping(message)]),
            ServerEvent::Error { error, .. } => {
                warn!("[{}] Relay rejected request: {}", self.options.context, error);
                Err(TransportError::Relay(error))
            }
        }
    }

    fn on_clients_waiting(&mut self, channel_id: String, count: usize) -> Vec<TransportEvent> {
        let mut events = vec![TransportEvent::ClientsWaiting { count }];

        // Alone in the room after an involuntary drop: the peer saw us leave
        // and has discarded the session, so ours is stale as well
        if self.rejoining_after_loss && count <= 1 {
            self.rejoining_after_loss = false;
            info!("[{}] Peer gone after reconnect to {}", self.options.context, channel_id);
            events.push(TransportEvent::ClientsDisconnected { channel_id });
        }

        events
    }

    fn on_clients_connected(&mut self, channel_id: String) -> Result<Vec<TransportEvent>, TransportError> {
        self.connected = true;
        self.rejoining_after_loss = false;
        let events = vec![TransportEvent::ClientsConnected { channel_id }];
        let keys_exchanged = self.key_exchange.keys_exchanged();

        if self.reconnect {
            self.reconnect = false;
            if keys_exchanged {
                debug!("[{}] Reconnected with keys, sending ready", self.options.context);
                self.send_message(&ControlMessage::Ready.into())?;
            } else if self.role == Some(Role::Responder) {
                debug!("[{}] Reconnected without keys, requesting handshake", self.options.context);
                // Whatever half-finished exchange we had belongs to the old connection
                self.key_exchange.abort();
                self.send_raw(&HandshakeMessage::Start)?;
            } else {
                self.start_handshake()?;
            }
            return Ok(events);
        }

        if !keys_exchanged {
            match self.role {
                Some(Role::Originator) => self.start_handshake()?,
                // Wait for the originator's SYN from a clean state
                Some(Role::Responder) => self.key_exchange.abort(),
                None => {}
            }
        }

        Ok(events)
    }

    fn on_message(&mut self, message: Value) -> Result<Vec<TransportEvent>, TransportError> {
        if !self.key_exchange.keys_exchanged() {
            let handshake: HandshakeMessage =
                serde_json::from_value(message).map_err(|_| TransportError::KeysNotExchanged)?;
            return self.on_handshake(handshake);
        }

        let ciphertext = match message {
            Value::String(ciphertext) => ciphertext,
            other => {
                // Raw handshake traffic after the exchange is a stale replay
                return match serde_json::from_value::<HandshakeMessage>(other) {
                    Ok(HandshakeMessage::Start) if self.is_originator() => {
                        info!("[{}] Peer requested a new handshake", self.options.context);
                        self.start_handshake()?;
                        Ok(Vec::new())
                    }
                    Ok(handshake) => {
                        debug!("[{}] Ignoring {} after key exchange", self.options.context, handshake.step_name());
                        Ok(Vec::new())
                    }
                    Err(_) => Err(TransportError::MalformedMessage(
                        "unencrypted message after key exchange".to_string(),
                    )),
                };
            }
        };

        let plaintext = self.key_exchange.decrypt(&ciphertext)?;
        let text = String::from_utf8(plaintext)
            .map_err(|_| TransportError::MalformedMessage("message is not UTF-8".to_string()))?;
        let msg = message::decode(&text)?;

        debug!(
            "[{}] Received {}",
            self.options.context,
            msg.message_type().unwrap_or("untyped message")
        );
        Ok(vec![TransportEvent::Message(msg)])
    }

    fn on_handshake(&mut self, handshake: HandshakeMessage) -> Result<Vec<TransportEvent>, TransportError> {
        // Before the exchange the originator restarts on `clients_connected` itself
        if handshake == HandshakeMessage::Start {
            debug!("[{}] Ignoring handshake request during exchange", self.options.context);
            return Ok(Vec::new());
        }

        let outcome = self.key_exchange.handle(&handshake)?;
        if let Some(reply) = outcome.reply {
            self.send_raw(&reply)?;
        }

        if !outcome.keys_exchanged {
            return Ok(Vec::new());
        }

        info!(
            "[{}] Keys exchanged on channel {} (key {})",
            self.options.context,
            self.channel_id.as_deref().unwrap_or_default(),
            self.key_exchange.shared_key_fingerprint().unwrap_or_default()
        );
        Ok(vec![TransportEvent::KeysExchanged {
            is_originator: self.is_originator(),
        }])
    }

    fn start_handshake(&mut self) -> Result<(), TransportError> {
        self.key_exchange.abort();
        let syn = self.key_exchange.start()?;
        self.send_raw(&syn)
    }

    // ========================================================================
    // OUTBOUND
    // ========================================================================

    /// Send a message to the peer.
    ///
    /// Before the key exchange only handshake messages are allowed, and they
    /// go out unencrypted. Afterwards everything is encrypted.
    pub fn send_message(&mut self, msg: &ChannelMessage) -> Result<(), TransportError> {
        let channel_id = self.channel_id.clone().ok_or(TransportError::ChannelNotCreated)?;

        if !self.key_exchange.keys_exchanged() {
            return match msg {
                ChannelMessage::Handshake(handshake) => self.send_raw(handshake),
                _ => Err(TransportError::KeysNotExchanged),
            };
        }

        let text = message::encode(msg)?;
        let ciphertext = self.key_exchange.encrypt(text.as_bytes())?;
        self.link.emit(ClientEvent::Message {
            id: channel_id,
            message: Value::String(ciphertext),
        })?;

        debug!(
            "[{}] Sent {}",
            self.options.context,
            msg.message_type().unwrap_or("untyped message")
        );
        Ok(())
    }

    fn send_raw(&mut self, handshake: &HandshakeMessage) -> Result<(), TransportError> {
        let channel_id = self.channel_id.clone().ok_or(TransportError::ChannelNotCreated)?;
        let message = serde_json::to_value(handshake)
            .map_err(|e| TransportError::MalformedMessage(e.to_string()))?;

        self.link.emit(ClientEvent::Message { id: channel_id, message })?;
        debug!("[{}] Sent {}", self.options.context, handshake.step_name());
        Ok(())
    }

    /// Send a liveness heartbeat
    pub fn send_ping(&mut self, message: Value) -> Result<(), TransportError> {
        let channel_id = self.channel_id.clone().ok_or(TransportError::ChannelNotCreated)?;
        self.link.emit(ClientEvent::Ping { id: channel_id, message })?;
        Ok(())
    }

    // ========================================================================
    // PAUSE / RESUME / TEARDOWN
    // ========================================================================

    /// Suspend the session: tell the peer, then drop the link.
    ///
    /// Keys are kept so `resume` can skip the handshake.
    pub fn pause(&mut self) {
        info!("[{}] Pausing", self.options.context);
        self.manual_disconnect = true;
        self.paused = true;

        if self.key_exchange.keys_exchanged() && self.link.is_connected() {
            if let Err(e) = self.send_message(&ControlMessage::Pause.into()) {
                warn!("[{}] Could not notify peer of pause: {}", self.options.context, e);
            }
        }

        self.link.disconnect();
        self.connected = false;
    }

    /// Reconnect and rejoin the same channel after `pause`
    pub fn resume(&mut self) -> Result<(), TransportError> {
        let channel_id = self.channel_id.clone().ok_or(TransportError::ChannelNotCreated)?;
        info!("[{}] Resuming channel {}", self.options.context, channel_id);

        self.manual_disconnect = false;
        self.paused = false;
        self.reconnect = true;
        self.rejoining_after_loss = false;
        self.awaiting_focus = false;

        self.link.connect()?;
        self.link.emit(ClientEvent::JoinChannel { id: channel_id })?;
        Ok(())
    }

    /// Leave the channel and close the link; no reconnect follows
    pub fn disconnect(&mut self) {
        info!("[{}] Disconnecting", self.options.context);
        self.manual_disconnect = true;
        self.leave_current_channel();
        self.link.disconnect();
        self.connected = false;
        self.awaiting_focus = false;
    }

    /// Tear everything down and start over with a fresh key pair.
    ///
    /// The pairing key supplied at construction belongs to the old pairing and
    /// is dropped, so the next channel needs a full handshake.
    pub fn reset(&mut self) {
        self.disconnect();
        self.key_exchange = KeyExchange::generate(true);
        self.options.other_public_key = None;
        self.role = None;
        self.channel_id = None;
        self.manual_disconnect = false;
        self.paused = false;
        self.reconnect = false;
        self.rejoining_after_loss = false;
        self.reconnect_attempts = 0;
        debug!("[{}] Transport reset", self.options.context);
    }

    // ========================================================================
    // RECONNECT
    // ========================================================================

    /// The link dropped without anyone asking for it.
    ///
    /// Depending on policy the transport reconnects now or waits for focus.
    pub fn handle_link_lost(&mut self, focus: &dyn HostFocus) -> Result<Vec<TransportEvent>, TransportError> {
        self.link.disconnect();
        self.connected = false;

        if self.manual_disconnect || self.channel_id.is_none() {
            return Ok(Vec::new());
        }
        self.rejoining_after_loss = true;

        if !self.options.reconnect_policy.allows(focus) {
            debug!("[{}] Link lost in background, waiting for focus", self.options.context);
            self.awaiting_focus = true;
            return Ok(Vec::new());
        }

        self.retry_reconnect()
    }

    /// The host came back to the foreground
    pub fn handle_focus_gained(&mut self) -> Result<Vec<TransportEvent>, TransportError> {
        if !self.awaiting_focus || self.manual_disconnect {
            return Ok(Vec::new());
        }
        self.awaiting_focus = false;
        self.retry_reconnect()
    }

    /// Make one reconnect attempt.
    ///
    /// A failed attempt is not an error for the caller, who should try again
    /// after [`SocketService::backoff_duration`]. Once the attempts run out a
    /// `ReconnectFailed` event is returned instead.
    pub fn retry_reconnect(&mut self) -> Result<Vec<TransportEvent>, TransportError> {
        let channel_id = self.channel_id.clone().ok_or(TransportError::ChannelNotCreated)?;

        if self.reconnect_attempts >= self.options.max_reconnect_attempts {
            warn!("[{}] Giving up after {} reconnect attempts", self.options.context, self.reconnect_attempts);
            return Ok(vec![TransportEvent::ReconnectFailed {
                attempts: self.reconnect_attempts,
            }]);
        }

        self.reconnect_attempts += 1;
        self.reconnect = true;

        let result = self
            .link
            .connect()
            .and_then(|_| self.link.emit(ClientEvent::JoinChannel { id: channel_id }));

        if let Err(e) = result {
            warn!(
                "[{}] Reconnect attempt {} failed: {}",
                self.options.context, self.reconnect_attempts, e
            );
            if self.reconnect_attempts >= self.options.max_reconnect_attempts {
                return Ok(vec![TransportEvent::ReconnectFailed {
                    attempts: self.reconnect_attempts,
                }]);
            }
        }

        Ok(Vec::new())
    }

    /// Delay before reconnect attempt number `attempt`
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_ms = self.options.reconnect_interval.as_millis() as u64;
        let backoff_ms = base_ms.saturating_mul(2u64.pow(attempt.min(5)));
        Duration::from_millis(backoff_ms).min(MAX_BACKOFF)
    }

    // ========================================================================
    // STATE
    // ========================================================================

    pub fn channel_id(&self) -> Option<&str> {
        self.channel_id.as_deref()
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn is_originator(&self) -> bool {
        self.role == Some(Role::Originator)
    }

    pub fn keys_exchanged(&self) -> bool {
        self.key_exchange.keys_exchanged()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.key_exchange.state()
    }

    pub fn my_public_key(&self) -> String {
        self.key_exchange.my_public_key()
    }

    /// Short fingerprint of the session key, for users to compare out of band
    pub fn key_fingerprint(&self) -> Option<String> {
        self.key_exchange.shared_key_fingerprint()
    }

    /// Both members are present on the relay
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnect
    }

    pub fn is_awaiting_focus(&self) -> bool {
        self.awaiting_focus
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn context(&self) -> &str {
        &self.options.context
    }

    pub(crate) fn key_exchange(&self) -> &KeyExchange {
        &self.key_exchange
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{LocalRelayLink, RelayErrorKind, RelayServer};
    use crate::transport::ReconnectPolicy;
    use serde_json::json;
    use std::net::IpAddr;
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Peer {
        service: SocketService,
        inbox: UnboundedReceiver<ServerEvent>,
        events: Vec<TransportEvent>,
        errors: Vec<TransportError>,
    }

    fn peer(server: &Arc<RelayServer>, last_octet: u8, options: TransportOptions) -> Peer {
        let (link, inbox) = LocalRelayLink::new(Arc::clone(server), IpAddr::from([10, 0, 0, last_octet]));
        let service = SocketService::new(Box::new(link), options).expect("Failed to create service");
        Peer {
            service,
            inbox,
            events: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn pump(a: &mut Peer, b: &mut Peer) {
        loop {
            let mut progressed = false;
            for p in [&mut *a, &mut *b] {
                while let Ok(event) = p.inbox.try_recv() {
                    progressed = true;
                    match p.service.handle_event(event) {
                        Ok(events) => p.events.extend(events),
                        Err(e) => p.errors.push(e),
                    }
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn paired() -> (Arc<RelayServer>, Peer, Peer) {
        let server = Arc::new(RelayServer::new());
        let mut a = peer(&server, 1, TransportOptions::default());
        let mut b = peer(&server, 2, TransportOptions::default());

        let channel = a.service.create_channel().expect("Failed to create channel");
        b.service
            .connect_to_channel(&channel.channel_id)
            .expect("Failed to join channel");
        pump(&mut a, &mut b);
        (server, a, b)
    }

    #[test]
    fn test_create_channel() {
        let server = Arc::new(RelayServer::new());
        let mut a = peer(&server, 1, TransportOptions::default());

        let channel = a.service.create_channel().expect("Failed to create channel");
        assert!(uuid::Uuid::try_parse(&channel.channel_id).is_ok());
        assert_eq!(channel.public_key, a.service.my_public_key());
        assert_eq!(a.service.role(), Some(Role::Originator));

        let event = a.inbox.try_recv().expect("Missing event");
        assert_eq!(
            a.service.handle_event(event).unwrap(),
            vec![TransportEvent::ChannelCreated {
                channel_id: channel.channel_id
            }]
        );
    }

    #[test]
    fn test_create_channel_twice_gives_distinct_ids() {
        let server = Arc::new(RelayServer::new());
        let mut a = peer(&server, 1, TransportOptions::default());

        let first = a.service.create_channel().unwrap();
        let second = a.service.create_channel().unwrap();
        assert_ne!(first.channel_id, second.channel_id);
        assert_eq!(a.service.channel_id(), Some(second.channel_id.as_str()));
    }

    #[test]
    fn test_handshake_over_relay() {
        let (_server, a, b) = paired();

        assert!(a.errors.is_empty(), "{:?}", a.errors);
        assert!(b.errors.is_empty(), "{:?}", b.errors);
        assert!(a.service.keys_exchanged());
        assert!(b.service.keys_exchanged());
        assert!(a.events.contains(&TransportEvent::KeysExchanged { is_originator: true }));
        assert!(b.events.contains(&TransportEvent::KeysExchanged { is_originator: false }));
        assert_eq!(
            a.service.key_exchange().shared_key_fingerprint(),
            b.service.key_exchange().shared_key_fingerprint()
        );
    }

    #[test]
    fn test_send_without_channel() {
        let server = Arc::new(RelayServer::new());
        let mut a = peer(&server, 1, TransportOptions::default());

        let result = a.service.send_message(&ControlMessage::Ready.into());
        assert_eq!(result, Err(TransportError::ChannelNotCreated));
    }

    #[test]
    fn test_send_before_exchange_rejected() {
        let server = Arc::new(RelayServer::new());
        let mut a = peer(&server, 1, TransportOptions::default());
        a.service.create_channel().unwrap();

        let result = a
            .service
            .send_message(&ChannelMessage::Application(json!({"type": "chat"})));
        assert_eq!(result, Err(TransportError::KeysNotExchanged));

        // Handshake messages may go out raw
        assert!(a.service.send_message(&HandshakeMessage::Start.into()).is_ok());
    }

    #[test]
    fn test_relayed_payload_is_ciphertext() {
        let (_server, mut a, mut b) = paired();
        let msg = ChannelMessage::Application(json!({"type": "chat", "text": "gm"}));

        a.service.send_message(&msg).expect("Failed to send");

        let relayed = b.inbox.try_recv().expect("Nothing relayed");
        let ServerEvent::Message { message, .. } = &relayed else {
            panic!("Expected message, got {:?}", relayed);
        };
        let opaque = message.as_str().expect("Payload is not a string");
        assert!(!opaque.contains("gm"));
        assert_ne!(opaque, message::encode(&msg).unwrap());

        let events = b.service.handle_event(relayed).expect("Failed to handle");
        assert_eq!(events, vec![TransportEvent::Message(msg)]);
    }

    #[test]
    fn test_unexpected_message_before_exchange() {
        let server = Arc::new(RelayServer::new());
        let mut a = peer(&server, 1, TransportOptions::default());
        let channel = a.service.create_channel().unwrap();

        let result = a.service.handle_event(ServerEvent::Message {
            id: channel.channel_id,
            message: json!({"type": "chat"}),
        });
        assert_eq!(result, Err(TransportError::KeysNotExchanged));
    }

    #[test]
    fn test_synack_before_syn_is_wrong_step() {
        let server = Arc::new(RelayServer::new());
        let mut a = peer(&server, 1, TransportOptions::default());
        let channel = a.service.create_channel().unwrap();
        let stranger = KeyExchange::new(None, true).unwrap();

        let result = a.service.handle_event(ServerEvent::Message {
            id: channel.channel_id,
            message: json!({"type": "key_handshake_SYNACK", "pubkey": stranger.my_public_key()}),
        });

        assert!(matches!(result, Err(TransportError::WrongHandshakeStep { .. })));
        assert!(!a.service.keys_exchanged());
    }

    #[test]
    fn test_wrong_channel() {
        let (_server, mut a, _b) = paired();
        let result = a.service.handle_event(ServerEvent::Message {
            id: uuid::Uuid::new_v4().to_string(),
            message: json!("00"),
        });
        assert!(matches!(result, Err(TransportError::WrongChannel { .. })));
    }

    #[test]
    fn test_garbage_after_exchange_is_decryption_failure() {
        let (_server, mut a, _b) = paired();
        let id = a.service.channel_id().unwrap().to_string();

        let result = a.service.handle_event(ServerEvent::Message {
            id,
            message: json!("deadbeef".repeat(10)),
        });
        assert_eq!(result, Err(TransportError::DecryptionFailed));
        // The session survives
        assert!(a.service.keys_exchanged());
    }

    #[test]
    fn test_third_member_gets_channel_full() {
        let (server, mut a, mut b) = paired();
        let mut c = peer(&server, 3, TransportOptions::default());
        let id = a.service.channel_id().unwrap().to_string();

        c.service.connect_to_channel(&id).unwrap();
        pump(&mut a, &mut c);
        pump(&mut b, &mut c);

        assert_eq!(c.errors, vec![TransportError::Relay(RelayErrorKind::ChannelFull)]);
        assert!(a.events.contains(&TransportEvent::ClientsDisconnected { channel_id: id.clone() }));
        assert!(b.events.contains(&TransportEvent::ClientsDisconnected { channel_id: id }));
    }

    #[test]
    fn test_pause_resume_keeps_keys() {
        let (_server, mut a, mut b) = paired();
        let fingerprint = a.service.key_exchange().shared_key_fingerprint();

        a.service.pause();
        pump(&mut a, &mut b);
        assert!(b.events.contains(&TransportEvent::Message(ControlMessage::Pause.into())));
        assert!(!b.service.is_connected());

        a.service.resume().expect("Failed to resume");
        pump(&mut a, &mut b);

        assert!(a.errors.is_empty() && b.errors.is_empty());
        assert!(b.events.contains(&TransportEvent::Message(ControlMessage::Ready.into())));
        assert!(!a.service.is_reconnecting());
        assert_eq!(a.service.key_exchange().shared_key_fingerprint(), fingerprint);
        assert_eq!(b.service.key_exchange().shared_key_fingerprint(), fingerprint);
    }

    #[test]
    fn test_start_request_restarts_originator() {
        let (_server, mut a, _b) = paired();
        let id = a.service.channel_id().unwrap().to_string();

        a.service
            .handle_event(ServerEvent::Message {
                id,
                message: json!({"type": "key_handshake_start"}),
            })
            .expect("Failed to handle");

        assert_eq!(a.service.handshake_state(), HandshakeState::AwaitSynAck);
    }

    #[test]
    fn test_reconnect_waits_for_focus() {
        let server = Arc::new(RelayServer::new());
        let options = TransportOptions {
            reconnect_policy: ReconnectPolicy::OnFocus,
            ..Default::default()
        };
        let mut a = peer(&server, 1, options);
        let mut b = peer(&server, 2, TransportOptions::default());
        let channel = a.service.create_channel().unwrap();
        b.service.connect_to_channel(&channel.channel_id).unwrap();
        pump(&mut a, &mut b);

        let backgrounded = || false;
        assert!(a.service.handle_link_lost(&backgrounded).unwrap().is_empty());
        assert!(a.service.is_awaiting_focus());
        pump(&mut a, &mut b);
        assert!(!b.service.is_connected());

        a.service.handle_focus_gained().expect("Failed to reconnect");
        pump(&mut a, &mut b);

        assert!(b.service.is_connected());
        assert!(b.events.contains(&TransportEvent::Message(ControlMessage::Ready.into())));
    }

    #[test]
    fn test_reconnect_to_empty_channel_reports_peer_gone() {
        let server = Arc::new(RelayServer::new());
        let options = TransportOptions {
            reconnect_policy: ReconnectPolicy::OnFocus,
            ..Default::default()
        };
        let mut a = peer(&server, 1, options);
        let mut b = peer(&server, 2, TransportOptions::default());
        let channel = a.service.create_channel().unwrap();
        b.service.connect_to_channel(&channel.channel_id).unwrap();
        pump(&mut a, &mut b);

        let backgrounded = || false;
        a.service.handle_link_lost(&backgrounded).expect("Failed to handle link loss");
        pump(&mut a, &mut b);
        // The peer drops its session on our disconnect and leaves
        b.service.reset();
        pump(&mut a, &mut b);

        a.events.clear();
        a.service.handle_focus_gained().expect("Failed to reconnect");
        pump(&mut a, &mut b);

        assert_eq!(
            a.events,
            vec![
                TransportEvent::ClientsWaiting { count: 1 },
                TransportEvent::ClientsDisconnected {
                    channel_id: channel.channel_id
                },
            ]
        );
    }

    #[test]
    fn test_responder_dropped_mid_handshake_recovers() {
        let server = Arc::new(RelayServer::new());
        let mut a = peer(&server, 1, TransportOptions::default());
        let mut b = peer(&server, 2, TransportOptions::default());
        let channel = a.service.create_channel().unwrap();
        b.service.connect_to_channel(&channel.channel_id).unwrap();

        // The originator sends its SYN, then the responder goes away unread
        while let Ok(event) = a.inbox.try_recv() {
            a.service.handle_event(event).expect("Failed to handle");
        }
        assert_eq!(a.service.handshake_state(), HandshakeState::AwaitSynAck);
        b.service.pause();
        pump(&mut a, &mut b);
        assert!(!b.service.keys_exchanged());

        a.errors.clear();
        b.errors.clear();
        b.service.resume().expect("Failed to resume");
        pump(&mut a, &mut b);

        assert!(a.errors.is_empty(), "{:?}", a.errors);
        assert!(b.errors.is_empty(), "{:?}", b.errors);
        assert!(a.service.keys_exchanged() && b.service.keys_exchanged());
        assert_eq!(
            a.service.key_exchange().shared_key_fingerprint(),
            b.service.key_exchange().shared_key_fingerprint()
        );
    }

    #[test]
    fn test_start_request_ignored_during_exchange() {
        let server = Arc::new(RelayServer::new());
        let mut a = peer(&server, 1, TransportOptions::default());
        let mut b = peer(&server, 2, TransportOptions::default());
        let channel = a.service.create_channel().unwrap();
        b.service.connect_to_channel(&channel.channel_id).unwrap();
        while let Ok(event) = a.inbox.try_recv() {
            a.service.handle_event(event).expect("Failed to handle");
        }

        let events = a
            .service
            .handle_event(ServerEvent::Message {
                id: channel.channel_id,
                message: json!({"type": "key_handshake_start"}),
            })
            .expect("Failed to handle");
        assert!(events.is_empty());
        assert_eq!(a.service.handshake_state(), HandshakeState::AwaitSynAck);

        let mut syns = 0;
        while let Ok(event) = b.inbox.try_recv() {
            if let ServerEvent::Message { message, .. } = event {
                assert_eq!(message["type"], "key_handshake_SYN");
                syns += 1;
            }
        }
        assert_eq!(syns, 1);
    }

    #[test]
    fn test_backoff_duration() {
        let server = Arc::new(RelayServer::new());
        let a = peer(&server, 1, TransportOptions::default());

        assert_eq!(a.service.backoff_duration(0), Duration::from_secs(1));
        assert_eq!(a.service.backoff_duration(3), Duration::from_secs(8));
        assert_eq!(a.service.backoff_duration(10), Duration::from_secs(32));
    }

    #[test]
    fn test_rejoin_same_channel_needs_new_handshake() {
        let (_server, mut a, mut b) = paired();
        let id = a.service.channel_id().unwrap().to_string();
        let old_key = a.service.key_exchange().shared_key().cloned().expect("No session key");

        b.service.reset();
        pump(&mut a, &mut b);
        assert!(a.events.contains(&TransportEvent::ClientsDisconnected { channel_id: id.clone() }));
        a.service.reset();

        a.service.recreate_channel(&id).expect("Failed to recreate channel");
        b.service.connect_to_channel(&id).expect("Failed to join channel");
        pump(&mut a, &mut b);

        assert!(a.errors.is_empty() && b.errors.is_empty());
        assert!(a.service.keys_exchanged() && b.service.keys_exchanged());
        let new_key = a.service.key_exchange().shared_key().cloned().unwrap();
        assert_ne!(new_key, old_key);

        let ciphertext = a.service.key_exchange().encrypt(b"{\"type\":\"chat\"}").unwrap();
        assert!(old_key.decrypt(&ciphertext).is_err());
        assert!(b.service.key_exchange().decrypt(&ciphertext).is_ok());
    }

    #[test]
    fn test_reset_starts_over() {
        let (_server, mut a, _b) = paired();
        let old_key = a.service.my_public_key();

        a.service.reset();

        assert_ne!(a.service.my_public_key(), old_key);
        assert!(a.service.channel_id().is_none());
        assert!(a.service.role().is_none());
        assert!(!a.service.keys_exchanged());
    }
}
