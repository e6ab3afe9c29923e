//! Remote Communication — session orchestration above the Secure Transport
//!
//! A secure channel alone does not make a session ready. After the key
//! exchange the originator sends its `originator_info`, the responder answers
//! with `wallet_info`, and only then does either side report `ClientsReady`.
//!
//! Outgoing application messages are queued while the session is not ready or
//! either side is paused, and flushed in call order once it is ready again.
//! A message that could never be sent is rejected at the call, not queued.

use super::{PairingPayload, SessionConfig, SessionError, SessionEvent};
use crate::message::{self, ChannelMessage, ControlMessage, OriginatorInfo, WalletInfo};
use crate::relay::{RelayLink, ServerEvent};
use crate::transport::{HostFocus, SocketService, TransportError, TransportEvent, TransportOptions};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Session Orchestrator for one participant
pub struct RemoteCommunication {
    transport: SocketService,
    config: SessionConfig,
    /// Metadata exchanged with the current peer
    connected: bool,
    ready: bool,
    /// The peer told us it is not listening
    paused: bool,
    originator_info: Option<OriginatorInfo>,
    wallet_info: Option<WalletInfo>,
    pending: VecDeque<ChannelMessage>,
}

impl RemoteCommunication {
    pub fn new(link: Box<dyn RelayLink>, config: SessionConfig) -> Result<Self, SessionError> {
        let options = TransportOptions {
            context: config.context.clone(),
            other_public_key: config.other_public_key.clone(),
            reconnect_policy: config.reconnect_policy,
            max_reconnect_attempts: config.max_reconnect_attempts,
            ..Default::default()
        };
        let transport = SocketService::new(link, options)?;

        Ok(Self {
            transport,
            config,
            connected: false,
            ready: false,
            paused: false,
            originator_info: None,
            wallet_info: None,
            pending: VecDeque::new(),
        })
    }

    /// Create a channel and return the payload to share with the responder
    pub fn generate_channel_id(&mut self) -> Result<PairingPayload, SessionError> {
        if self.connected || self.transport.is_connected() {
            return Err(SessionError::ChannelAlreadyCreated);
        }

        self.clear_session();
        let channel = self.transport.create_channel()?;
        Ok(PairingPayload::new(channel.channel_id, channel.public_key))
    }

    /// Join the channel named in a pairing payload
    pub fn connect_to_channel(&mut self, channel_id: &str) -> Result<(), SessionError> {
        if self.connected || self.transport.is_connected() {
            return Err(SessionError::ChannelAlreadyCreated);
        }

        self.clear_session();
        self.transport.connect_to_channel(channel_id)?;
        Ok(())
    }

    /// Send a message to the peer, queueing it until the session is ready
    pub fn send_message(&mut self, msg: ChannelMessage) -> Result<(), SessionError> {
        if self.transport.channel_id().is_none() {
            return Err(TransportError::ChannelNotCreated.into());
        }
        message::encode(&msg).map_err(TransportError::from)?;

        if !self.ready || self.paused || self.transport.is_paused() {
            debug!(
                "[{}] Queueing {} until ready",
                self.config.context,
                msg.message_type().unwrap_or("message")
            );
            self.pending.push_back(msg);
            return Ok(());
        }

        if !self.pending.is_empty() {
            // Stay behind the backlog
            self.pending.push_back(msg);
            self.flush_pending();
            return Ok(());
        }

        self.transport.send_message(&msg)?;
        Ok(())
    }

    /// Process one relay event
    pub fn handle_event(&mut self, event: ServerEvent) -> Result<Vec<SessionEvent>, SessionError> {
        let transport_events = self.transport.handle_event(event)?;
        self.process(transport_events)
    }

    fn process(&mut self, transport_events: Vec<TransportEvent>) -> Result<Vec<SessionEvent>, SessionError> {
        let mut events = Vec::new();
        for event in transport_events {
            self.on_transport_event(event, &mut events)?;
        }
        Ok(events)
    }

    fn on_transport_event(
        &mut self,
        event: TransportEvent,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), SessionError> {
        match event {
            TransportEvent::ChannelCreated { channel_id } => {
                events.push(SessionEvent::ChannelCreated { channel_id });
            }
            TransportEvent::ClientsWaiting { count } => {
                events.push(SessionEvent::ClientsWaiting { count });
            }
            TransportEvent::ClientsConnected { .. } => {
                // A resumed session sent `ready` already; our own backlog can go
                if self.ready && !self.paused && self.transport.keys_exchanged() {
                    self.flush_pending();
                }
            }
            TransportEvent::KeysExchanged { is_originator } => {
                if is_originator {
                    let info = self.config.originator_info.clone();
                    debug!("[{}] Sending originator info", self.config.context);
                    self.transport.send_message(
                        &ControlMessage::OriginatorInfo { originator_info: info }.into(),
                    )?;
                }
            }
            TransportEvent::ClientsDisconnected { channel_id } => {
                if self.paused || self.transport.is_paused() {
                    debug!("[{}] Peer disconnected while paused", self.config.context);
                    return Ok(());
                }

                info!("[{}] Peer disconnected, session invalidated", self.config.context);
                self.pending.clear();
                self.clear_session();
                self.transport.reset();
                events.push(SessionEvent::ClientsDisconnected { channel_id });
            }
            TransportEvent::Message(msg) => self.on_message(msg, events)?,
            TransportEvent::Ping(message) => events.push(SessionEvent::Ping(message)),
            TransportEvent::ReconnectFailed { attempts } => {
                events.push(SessionEvent::ReconnectFailed { attempts });
            }
        }
        Ok(())
    }

    fn on_message(&mut self, msg: ChannelMessage, events: &mut Vec<SessionEvent>) -> Result<(), SessionError> {
        match msg {
            ChannelMessage::Control(ControlMessage::OriginatorInfo { originator_info }) => {
                debug!("[{}] Received originator info from {}", self.config.context, originator_info.url);
                self.originator_info = Some(originator_info);
                self.wallet_info = Some(self.config.wallet_info.clone());

                self.transport.send_message(
                    &ControlMessage::WalletInfo {
                        wallet_info: self.config.wallet_info.clone(),
                    }
                    .into(),
                )?;
                self.mark_ready(events);
            }
            ChannelMessage::Control(ControlMessage::WalletInfo { wallet_info }) => {
                debug!("[{}] Received wallet info ({})", self.config.context, wallet_info.wallet_type);
                self.wallet_info = Some(wallet_info);
                self.originator_info = Some(self.config.originator_info.clone());
                self.mark_ready(events);
            }
            ChannelMessage::Control(ControlMessage::Pause) => {
                debug!("[{}] Peer paused", self.config.context);
                self.paused = true;
                events.push(SessionEvent::Message(msg));
            }
            ChannelMessage::Control(ControlMessage::Ready) => {
                debug!("[{}] Peer ready", self.config.context);
                self.mark_ready(events);
                events.push(SessionEvent::Message(msg));
            }
            other => events.push(SessionEvent::Message(other)),
        }
        Ok(())
    }

    fn mark_ready(&mut self, events: &mut Vec<SessionEvent>) {
        self.connected = true;
        self.ready = true;
        self.paused = false;

        events.push(SessionEvent::ClientsReady {
            is_originator: self.transport.is_originator(),
            originator_info: self.originator_info.clone(),
            wallet_info: self.wallet_info.clone(),
        });

        self.flush_pending();
    }

    /// Send the backlog in order.
    ///
    /// A link failure stops the flush with the failed message back at the
    /// front; the next `ClientsReady` or rejoin retries it. Any other failure
    /// drops that one message and carries on.
    fn flush_pending(&mut self) {
        if !self.pending.is_empty() {
            debug!("[{}] Flushing {} queued messages", self.config.context, self.pending.len());
        }
        while let Some(msg) = self.pending.pop_front() {
            match self.transport.send_message(&msg) {
                Ok(()) => {}
                Err(e @ TransportError::Link(_)) => {
                    warn!("[{}] Flush interrupted: {}", self.config.context, e);
                    self.pending.push_front(msg);
                    return;
                }
                Err(e) => warn!(
                    "[{}] Dropping queued {}: {}",
                    self.config.context,
                    msg.message_type().unwrap_or("message"),
                    e
                ),
            }
        }
    }

    fn clear_session(&mut self) {
        self.connected = false;
        self.ready = false;
        self.paused = false;
        self.originator_info = None;
        self.wallet_info = None;
    }

    /// Suspend the session; the peer is told and keys are kept
    pub fn pause(&mut self) {
        self.transport.pause();
    }

    /// Rejoin the paused channel without a new handshake
    pub fn resume(&mut self) -> Result<(), SessionError> {
        self.transport.resume()?;
        Ok(())
    }

    /// Tear the session down: leave the channel, forget the session key,
    /// and drop everything still queued
    pub fn disconnect(&mut self) {
        if !self.pending.is_empty() {
            debug!("[{}] Dropping {} queued messages", self.config.context, self.pending.len());
        }
        self.pending.clear();
        self.clear_session();
        self.transport.reset();
    }

    pub fn handle_link_lost(&mut self, focus: &dyn HostFocus) -> Result<Vec<SessionEvent>, SessionError> {
        let transport_events = self.transport.handle_link_lost(focus)?;
        self.process(transport_events)
    }

    pub fn handle_focus_gained(&mut self) -> Result<Vec<SessionEvent>, SessionError> {
        let transport_events = self.transport.handle_focus_gained()?;
        self.process(transport_events)
    }

    pub fn retry_reconnect(&mut self) -> Result<Vec<SessionEvent>, SessionError> {
        let transport_events = self.transport.retry_reconnect()?;
        self.process(transport_events)
    }

    pub fn send_ping(&mut self, message: serde_json::Value) -> Result<(), SessionError> {
        self.transport.send_ping(message)?;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// The peer paused the session
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.transport.channel_id()
    }

    pub fn originator_info(&self) -> Option<&OriginatorInfo> {
        self.originator_info.as_ref()
    }

    pub fn wallet_info(&self) -> Option<&WalletInfo> {
        self.wallet_info.as_ref()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn transport(&self) -> &SocketService {
        &self.transport
    }
}

// ============================================================================
// TESTS
// ============================================================================
