// WebSocket relay binding RelayServer to real sockets
//
// One task per connection. Text frames carry JSON relay events; anything
// else is ignored. Closing the socket leaves every channel the client was in.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use pairlink_core::{ClientEvent, RelayServer, RelayServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// How often the relay logs its statistics
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Run the relay until the process is stopped
pub async fn run(config: RelayServerConfig, port: u16) -> Result<()> {
    let server = Arc::new(RelayServer::with_config(config));
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind relay port {}", port))?;

    info!("Relay listening on {}", listener.local_addr()?);

    let stats_server = Arc::clone(&server);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        loop {
            ticker.tick().await;
            let stats = stats_server.stats();
            info!(
                "channels={} connections={} relayed={} rate_limited={}",
                stats.channels_active, stats.connections_active, stats.messages_relayed, stats.rate_limited
            );
        }
    });

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };

        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(server, stream, peer).await {
                debug!("Connection {} ended: {:#}", peer, e);
            }
        });
    }
}

async fn handle_connection(server: Arc<RelayServer>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    let (mut write, mut read) = ws.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let conn = server.connect(peer.ip(), outbound_tx);
    debug!("Client {} connected as {}", peer, conn);

    let result: Result<()> = async {
        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match ClientEvent::from_json(&text) {
                        Ok(event) => server.handle(conn, event),
                        Err(e) => debug!("Dropping malformed frame from {}: {}", peer, e),
                    },
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("Read failed"),
                },
                Some(event) = outbound_rx.recv() => {
                    let text = event.to_json()?;
                    write.send(Message::Text(text)).await.context("Write failed")?;
                }
            }
        }
    }
    .await;

    server.disconnect(conn);
    debug!("Client {} disconnected", peer);
    result
}
