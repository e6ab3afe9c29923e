//! Relay Server — routes opaque payloads between the two members of a channel
//!
//! The server owns no key material and never interprets relayed payloads.
//! Outbound events are pushed into each connection's unbounded queue and
//! never block the caller.

use super::channels::{ChannelStore, ConnectionId, JoinOutcome};
use super::protocol::{is_valid_channel_id, ClientEvent, RelayErrorKind, ServerEvent};
use super::rate_limit::OriginRateLimiter;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Characters of a relayed payload shown in debug logs
const DEBUG_PREVIEW_CHARS: usize = 16;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// create/join operations allowed per origin per window
    pub channel_ops_per_window: u32,
    /// message/ping operations allowed per origin per window
    pub message_ops_per_window: u32,
    /// Rate limiting window
    pub window: Duration,
    /// Maximum origins tracked by each limiter
    pub max_tracked_origins: usize,
    /// Log relayed traffic (opaque form only)
    pub debug: bool,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            channel_ops_per_window: 5,
            message_ops_per_window: 50,
            window: Duration::from_secs(1),
            max_tracked_origins: 10_000,
            debug: false,
        }
    }
}

/// Statistics about relay server operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayServerStats {
    /// Channels with at least one member
    pub channels_active: usize,
    /// Connected clients
    pub connections_active: usize,
    /// Payloads forwarded to a peer
    pub messages_relayed: u64,
    /// Operations dropped by the rate limiters
    pub rate_limited: u64,
}

/// A connected client
#[derive(Debug)]
struct Connection {
    origin: IpAddr,
    outbound: mpsc::UnboundedSender<ServerEvent>,
    channels: HashSet<String>,
}

/// The relay server
pub struct RelayServer {
    config: RelayServerConfig,
    channels: ChannelStore,
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    next_connection_id: AtomicU64,
    channel_limiter: OriginRateLimiter,
    message_limiter: OriginRateLimiter,
    messages_relayed: AtomicU64,
    rate_limited: AtomicU64,
}

impl RelayServer {
    /// Create a relay server with default configuration
    pub fn new() -> Self {
        Self::with_config(RelayServerConfig::default())
    }

    pub fn with_config(config: RelayServerConfig) -> Self {
        Self::with_store(config, ChannelStore::new())
    }

    /// Create a relay server over an existing channel store
    pub fn with_store(config: RelayServerConfig, channels: ChannelStore) -> Self {
        let channel_limiter = OriginRateLimiter::new(
            config.channel_ops_per_window,
            config.window,
            config.max_tracked_origins,
        );
        let message_limiter = OriginRateLimiter::new(
            config.message_ops_per_window,
            config.window,
            config.max_tracked_origins,
        );

        Self {
            config,
            channels,
            connections: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            channel_limiter,
            message_limiter,
            messages_relayed: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
        }
    }

    /// Register a client connection; events for it are pushed to `outbound`
    pub fn connect(&self, origin: IpAddr, outbound: mpsc::UnboundedSender<ServerEvent>) -> ConnectionId {
        let conn = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.connections.write().insert(
            conn,
            Connection {
                origin,
                outbound,
                channels: HashSet::new(),
            },
        );
        debug!("Connection {} opened from {}", conn, origin);
        conn
    }

    /// Drop a client connection, leaving every channel it was in
    pub fn disconnect(&self, conn: ConnectionId) {
        let Some(connection) = self.connections.write().remove(&conn) else {
            return;
        };
        debug!("Connection {} closed", conn);

        for id in connection.channels {
            if let Some(remaining) = self.channels.leave(&id, conn) {
                self.broadcast(&remaining, ServerEvent::ClientsDisconnected { id: id.clone() });
            }
        }
    }

    /// Process one event from a client
    pub fn handle(&self, conn: ConnectionId, event: ClientEvent) {
        let Some(origin) = self.origin_of(conn) else {
            debug!("Event from unknown connection {}", conn);
            return;
        };

        match event {
            ClientEvent::CreateChannel { id } => {
                if self.limited(&self.channel_limiter, origin) {
                    return;
                }
                self.create_channel(conn, id);
            }
            ClientEvent::JoinChannel { id } => {
                if self.limited(&self.channel_limiter, origin) {
                    return;
                }
                self.join_channel(conn, id);
            }
            ClientEvent::LeaveChannel { id } => self.leave_channel(conn, id),
            ClientEvent::Message { id, message } => {
                if self.limited(&self.message_limiter, origin) {
                    return;
                }
                self.log_relayed("message", &id, &message);
                self.relay(conn, &id.clone(), ServerEvent::Message { id, message });
            }
            ClientEvent::Ping { id, message } => {
                if self.limited(&self.message_limiter, origin) {
                    return;
                }
                self.log_relayed("ping", &id, &message);
                self.relay(conn, &id.clone(), ServerEvent::Ping { id, message });
            }
        }
    }

    /// Get current server statistics
    pub fn stats(&self) -> RelayServerStats {
        RelayServerStats {
            channels_active: self.channels.channel_count(),
            connections_active: self.connections.read().len(),
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }

    /// Membership store backing this server
    pub fn channels(&self) -> &ChannelStore {
        &self.channels
    }

    fn create_channel(&self, conn: ConnectionId, id: String) {
        if !is_valid_channel_id(&id) {
            self.send_to(conn, ServerEvent::Error { id, error: RelayErrorKind::InvalidChannelId });
            return;
        }

        match self.channels.create(&id, conn) {
            Ok(()) => {
                self.track_membership(conn, &id);
                info!("Channel {} created", id);
                self.send_to(conn, ServerEvent::ChannelCreated { id });
            }
            Err(error) => self.send_to(conn, ServerEvent::Error { id, error }),
        }
    }

    fn join_channel(&self, conn: ConnectionId, id: String) {
        if !is_valid_channel_id(&id) {
            self.send_to(conn, ServerEvent::Error { id, error: RelayErrorKind::InvalidChannelId });
            return;
        }

        match self.channels.join(&id, conn) {
            JoinOutcome::Waiting { count } => {
                self.track_membership(conn, &id);
                self.broadcast(&self.channels.members(&id), ServerEvent::ClientsWaitingToJoin { id, count });
            }
            JoinOutcome::Connected { members } => {
                self.track_membership(conn, &id);
                debug!("Channel {} connected", id);
                self.broadcast(&members, ServerEvent::ClientsConnected { id });
            }
            JoinOutcome::AlreadyMember { count } => {
                debug!("Connection {} already in channel {} ({} members)", conn, id, count);
            }
            JoinOutcome::Full { evicted } => {
                info!("Channel {} full, evicting {} members", id, evicted.len());
                {
                    let mut connections = self.connections.write();
                    for member in &evicted {
                        if let Some(connection) = connections.get_mut(member) {
                            connection.channels.remove(&id);
                        }
                    }
                }
                self.broadcast(&evicted, ServerEvent::ClientsDisconnected { id: id.clone() });
                self.send_to(conn, ServerEvent::Error { id, error: RelayErrorKind::ChannelFull });
            }
        }
    }

    fn leave_channel(&self, conn: ConnectionId, id: String) {
        if let Some(connection) = self.connections.write().get_mut(&conn) {
            connection.channels.remove(&id);
        }
        if let Some(remaining) = self.channels.leave(&id, conn) {
            self.broadcast(&remaining, ServerEvent::ClientsDisconnected { id });
        }
    }

    /// Forward to every other member of the channel, never back to the sender
    fn relay(&self, sender: ConnectionId, id: &str, event: ServerEvent) {
        let members = self.channels.members(id);
        if !members.contains(&sender) {
            debug!("Connection {} relayed into channel {} without joining it", sender, id);
            return;
        }

        let recipients: Vec<ConnectionId> = members.into_iter().filter(|m| *m != sender).collect();
        self.messages_relayed
            .fetch_add(recipients.len() as u64, Ordering::Relaxed);
        self.broadcast(&recipients, event);
    }

    fn broadcast(&self, recipients: &[ConnectionId], event: ServerEvent) {
        let connections = self.connections.read();
        for conn in recipients {
            if let Some(connection) = connections.get(conn) {
                // Fire-and-forget: a closed receiver means the client is gone
                let _ = connection.outbound.send(event.clone());
            }
        }
    }

    fn send_to(&self, conn: ConnectionId, event: ServerEvent) {
        self.broadcast(&[conn], event);
    }

    fn track_membership(&self, conn: ConnectionId, id: &str) {
        if let Some(connection) = self.connections.write().get_mut(&conn) {
            connection.channels.insert(id.to_string());
        }
    }

    fn origin_of(&self, conn: ConnectionId) -> Option<IpAddr> {
        self.connections.read().get(&conn).map(|c| c.origin)
    }

    fn limited(&self, limiter: &OriginRateLimiter, origin: IpAddr) -> bool {
        if limiter.check_and_record(origin) {
            return false;
        }
        // No reply to the caller
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
        debug!("Rate limited operation from {}", origin);
        true
    }

    fn log_relayed(&self, kind: &str, id: &str, message: &Value) {
        if !self.config.debug {
            return;
        }
        let opaque = message.to_string();
        let preview: String = opaque.chars().take(DEBUG_PREVIEW_CHARS).collect();
        debug!("{}-{} -> {} bytes [{}..]", kind, id, opaque.len(), preview);
    }
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
