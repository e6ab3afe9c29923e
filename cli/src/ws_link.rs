// WebSocket relay link
//
// The session layer is synchronous, so the socket lives in a background task.
// Outbound events are queued on a channel and written in order once the
// socket is up; inbound events and link loss come back as `LinkSignal`s.

use futures::{SinkExt, StreamExt};
use pairlink_core::{ClientEvent, LinkError, RelayLink, ServerEvent};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// What the socket task reports back to the peer loop
#[derive(Debug)]
pub enum LinkSignal {
    Event(ServerEvent),
    /// The socket dropped or never came up
    Lost(String),
}

enum LinkCommand {
    Emit(ClientEvent),
    Close,
}

pub struct WsRelayLink {
    url: String,
    signals: mpsc::UnboundedSender<LinkSignal>,
    commands: Option<mpsc::UnboundedSender<LinkCommand>>,
}

impl WsRelayLink {
    pub fn new(url: impl Into<String>, signals: mpsc::UnboundedSender<LinkSignal>) -> Self {
        Self {
            url: url.into(),
            signals,
            commands: None,
        }
    }
}

impl RelayLink for WsRelayLink {
    fn connect(&mut self) -> Result<(), LinkError> {
        if self.is_connected() {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| LinkError::ConnectionFailed(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_socket(self.url.clone(), rx, self.signals.clone()));
        self.commands = Some(tx);
        debug!("Connecting to relay {}", self.url);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(LinkCommand::Close);
        }
    }

    fn is_connected(&self) -> bool {
        self.commands.as_ref().is_some_and(|c| !c.is_closed())
    }

    fn emit(&mut self, event: ClientEvent) -> Result<(), LinkError> {
        let commands = self.commands.as_ref().ok_or(LinkError::NotConnected)?;
        commands
            .send(LinkCommand::Emit(event))
            .map_err(|_| LinkError::SendFailed("relay socket closed".to_string()))
    }
}

impl Drop for WsRelayLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn run_socket(
    url: String,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    signals: mpsc::UnboundedSender<LinkSignal>,
) {
    let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!("Failed to reach relay {}: {}", url, e);
            let _ = signals.send(LinkSignal::Lost(e.to_string()));
            return;
        }
    };
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Emit(event)) => {
                    let text = match event.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Dropping unencodable {} event: {}", event.event_name(), e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(text)).await {
                        let _ = signals.send(LinkSignal::Lost(e.to_string()));
                        return;
                    }
                }
                Some(LinkCommand::Close) | None => {
                    let _ = write.close().await;
                    return;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match ServerEvent::from_json(&text) {
                    Ok(event) => {
                        let _ = signals.send(LinkSignal::Event(event));
                    }
                    Err(e) => debug!("Ignoring malformed relay frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    let _ = signals.send(LinkSignal::Lost("closed by relay".to_string()));
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = signals.send(LinkSignal::Lost(e.to_string()));
                    return;
                }
            }
        }
    }
}
