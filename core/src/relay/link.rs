//! The socket a session uses to reach the relay
//!
//! The Secure Transport only ever talks to the relay through [`RelayLink`],
//! so it can run over a WebSocket, an in-process server, or a test double.
//! Inbound [`ServerEvent`]s are delivered by whatever drives the session.

use super::channels::ConnectionId;
use super::protocol::{ClientEvent, ServerEvent};
use super::server::RelayServer;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Relay link errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Not connected to relay")]
    NotConnected,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Outbound half of a relay connection
pub trait RelayLink: Send {
    /// Open (or re-open) the connection
    fn connect(&mut self) -> Result<(), LinkError>;

    /// Close the connection; the relay treats this as leaving every channel
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Send one event. Fire-and-forget: success only means it was handed off.
    fn emit(&mut self, event: ClientEvent) -> Result<(), LinkError>;
}

/// In-process link to a [`RelayServer`]
///
/// Each `connect` registers a fresh relay connection whose events land in the
/// receiver returned by [`LocalRelayLink::new`].
pub struct LocalRelayLink {
    server: Arc<RelayServer>,
    origin: IpAddr,
    inbound: mpsc::UnboundedSender<ServerEvent>,
    connection: Option<ConnectionId>,
}

impl LocalRelayLink {
    pub fn new(server: Arc<RelayServer>, origin: IpAddr) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (inbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                server,
                origin,
                inbound,
                connection: None,
            },
            rx,
        )
    }

    /// Relay-side id of the current connection
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection
    }
}

impl RelayLink for LocalRelayLink {
    fn connect(&mut self) -> Result<(), LinkError> {
        if self.connection.is_none() {
            let conn = self.server.connect(self.origin, self.inbound.clone());
            debug!("Local link connected as {}", conn);
            self.connection = Some(conn);
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            self.server.disconnect(conn);
        }
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn emit(&mut self, event: ClientEvent) -> Result<(), LinkError> {
        let conn = self.connection.ok_or(LinkError::NotConnected)?;
        self.server.handle(conn, event);
        Ok(())
    }
}

impl Drop for LocalRelayLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_emit_requires_connection() {
        let server = Arc::new(RelayServer::new());
        let (mut link, _rx) = LocalRelayLink::new(server, IpAddr::V4(Ipv4Addr::LOCALHOST));

        let result = link.emit(ClientEvent::LeaveChannel { id: "x".to_string() });
        assert_eq!(result, Err(LinkError::NotConnected));
    }

    #[test]
    fn test_connect_is_idempotent() {
        let server = Arc::new(RelayServer::new());
        let (mut link, _rx) = LocalRelayLink::new(Arc::clone(&server), IpAddr::V4(Ipv4Addr::LOCALHOST));

        link.connect().expect("Failed to connect");
        let first = link.connection_id();
        link.connect().expect("Failed to connect");

        assert_eq!(link.connection_id(), first);
        assert_eq!(server.stats().connections_active, 1);
    }

    #[test]
    fn test_events_reach_receiver() {
        let server = Arc::new(RelayServer::new());
        let (mut link, mut rx) = LocalRelayLink::new(Arc::clone(&server), IpAddr::V4(Ipv4Addr::LOCALHOST));
        let id = uuid::Uuid::new_v4().to_string();

        link.connect().expect("Failed to connect");
        link.emit(ClientEvent::CreateChannel { id: id.clone() })
            .expect("Failed to emit");

        assert_eq!(rx.try_recv().ok(), Some(ServerEvent::ChannelCreated { id }));
    }

    #[test]
    fn test_drop_disconnects() {
        let server = Arc::new(RelayServer::new());
        {
            let (mut link, _rx) = LocalRelayLink::new(Arc::clone(&server), IpAddr::V4(Ipv4Addr::LOCALHOST));
            link.connect().expect("Failed to connect");
            assert_eq!(server.stats().connections_active, 1);
        }
        assert_eq!(server.stats().connections_active, 0);
    }
}
