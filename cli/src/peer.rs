// Interactive peer — drives a RemoteCommunication session over a WebSocket relay
//
// Lines typed on stdin are sent as chat messages. A few slash commands map
// onto session operations: /pause, /resume, /ping, /quit.

use crate::ws_link::{LinkSignal, WsRelayLink};
use anyhow::{Context, Result};
use colored::*;
use pairlink_core::{
    AlwaysFocused, ChannelMessage, ControlMessage, PairingPayload, RemoteCommunication, SessionConfig,
    SessionEvent,
};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};

const DEEP_LINK_BASE: &str = "pairlink://connect";

/// Which end of the pairing this process plays
pub enum PeerRole {
    Originator,
    Responder(PairingPayload),
}

enum Flow {
    Continue,
    Stop,
}

pub async fn run(relay_url: &str, role: PeerRole, mut config: SessionConfig) -> Result<()> {
    if let PeerRole::Responder(pairing) = &role {
        pairing.validate()?;
        config.other_public_key = Some(pairing.public_key.clone());
    }

    let (signals_tx, mut signals) = mpsc::unbounded_channel();
    let link = WsRelayLink::new(relay_url, signals_tx);
    let mut session = RemoteCommunication::new(Box::new(link), config).context("Failed to create session")?;
    let is_originator = matches!(role, PeerRole::Originator);

    match &role {
        PeerRole::Originator => announce_channel(&mut session)?,
        PeerRole::Responder(pairing) => {
            session.connect_to_channel(&pairing.channel_id)?;
            println!("{} {}", "Joining channel".bright_cyan(), pairing.channel_id.bright_white());
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let retry_timer = sleep(Duration::ZERO);
    tokio::pin!(retry_timer);
    let mut retry_armed = false;

    loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                Some(LinkSignal::Event(event)) => match session.handle_event(event) {
                    Ok(events) => {
                        for event in events {
                            if let Flow::Stop = render(&mut session, event, is_originator)? {
                                return Ok(());
                            }
                        }
                    }
                    Err(e) => println!("{} {}", "⚠".yellow(), e),
                },
                Some(LinkSignal::Lost(reason)) => {
                    warn!("Relay link lost: {}", reason);
                    let attempts = session.transport().reconnect_attempts();
                    if attempts == 0 {
                        println!("{}", "Relay connection lost, reconnecting...".yellow());
                        let events = session.handle_link_lost(&AlwaysFocused)?;
                        for event in events {
                            if let Flow::Stop = render(&mut session, event, is_originator)? {
                                return Ok(());
                            }
                        }
                    } else {
                        let delay = session.transport().backoff_duration(attempts);
                        debug!("Next reconnect attempt in {:?}", delay);
                        retry_timer.as_mut().reset(Instant::now() + delay);
                        retry_armed = true;
                    }
                }
                None => return Ok(()),
            },
            () = &mut retry_timer, if retry_armed => {
                retry_armed = false;
                for event in session.retry_reconnect()? {
                    if let Flow::Stop = render(&mut session, event, is_originator)? {
                        return Ok(());
                    }
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    session.disconnect();
                    return Ok(());
                };
                if let Flow::Stop = handle_input(&mut session, line.trim())? {
                    return Ok(());
                }
            }
        }
    }
}

fn announce_channel(session: &mut RemoteCommunication) -> Result<()> {
    let pairing = session.generate_channel_id()?;
    println!();
    println!("{}", "Pairing payload (give this to the responder):".bright_cyan().bold());
    println!("  {}", pairing.to_json()?.bright_white());
    println!("  {}", pairing.to_deep_link(DEEP_LINK_BASE).dimmed());
    println!();
    Ok(())
}

fn handle_input(session: &mut RemoteCommunication, line: &str) -> Result<Flow> {
    match line {
        "" => {}
        "/quit" => {
            session.disconnect();
            println!("{}", "Disconnected".bright_yellow());
            return Ok(Flow::Stop);
        }
        "/pause" => {
            session.pause();
            println!("{}", "Paused".bright_yellow());
        }
        "/resume" => {
            session.resume()?;
            println!("{}", "Resuming...".bright_yellow());
        }
        "/ping" => session.send_ping(json!({"type": "ping"}))?,
        text => {
            session.send_message(ChannelMessage::Application(json!({"type": "chat", "text": text})))?;
            if !session.is_ready() || session.is_paused() {
                println!("{} ({} queued)", "Held until the peer is ready".dimmed(), session.pending_count());
            }
        }
    }
    Ok(Flow::Continue)
}

fn render(session: &mut RemoteCommunication, event: SessionEvent, is_originator: bool) -> Result<Flow> {
    match event {
        SessionEvent::ChannelCreated { channel_id } => {
            println!("{} {}", "Channel created".green(), channel_id.dimmed());
        }
        SessionEvent::ClientsWaiting { count } => {
            println!("{} ({} in channel)", "Waiting for peer".dimmed(), count);
        }
        SessionEvent::ClientsReady {
            originator_info,
            wallet_info,
            ..
        } => {
            let peer = match (originator_info, wallet_info) {
                (Some(info), _) => format!("{} ({})", info.title, info.url),
                (None, Some(info)) => format!("{} {}", info.wallet_type, info.version),
                (None, None) => "peer".to_string(),
            };
            println!("{} {}", "✓ Secure channel ready with".green().bold(), peer.bright_white());
            if let Some(fingerprint) = session.transport().key_fingerprint() {
                println!("  {} {}", "Session key:".dimmed(), fingerprint.dimmed());
            }
        }
        SessionEvent::ClientsDisconnected { .. } => {
            println!("{}", "Peer disconnected, session closed".bright_red());
            if !is_originator {
                return Ok(Flow::Stop);
            }
            announce_channel(session)?;
        }
        SessionEvent::Message(ChannelMessage::Control(ControlMessage::Pause)) => {
            println!("{}", "Peer paused".yellow());
        }
        SessionEvent::Message(ChannelMessage::Control(ControlMessage::Ready)) => {
            println!("{}", "Peer is back".green());
        }
        SessionEvent::Message(ChannelMessage::Application(value)) => {
            match value.get("text").and_then(|t| t.as_str()) {
                Some(text) => println!("{} {}", "peer>".bright_magenta(), text),
                None => println!("{} {}", "peer>".bright_magenta(), value.to_string().dimmed()),
            }
        }
        SessionEvent::Message(other) => debug!("Unhandled message: {:?}", other),
        SessionEvent::Ping(value) => debug!("Ping from peer: {}", value),
        SessionEvent::ReconnectFailed { attempts } => {
            println!("{} after {} attempts", "✗ Could not reach the relay".red(), attempts);
            return Ok(Flow::Stop);
        }
    }
    Ok(Flow::Continue)
}
