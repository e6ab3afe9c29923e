// pairlink — relay server and interactive peers
//
// Cross-platform (macOS, Linux, Windows) command-line interface for Pairlink.

mod config;
mod peer;
mod relay_server;
mod ws_link;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use pairlink_core::PairingPayload;
use peer::PeerRole;

#[derive(Parser)]
#[command(name = "pairlink")]
#[command(about = "Pairlink — encrypted pairing over an untrusted relay", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Relay {
        #[arg(short, long)]
        port: Option<u16>,
        /// Log relayed traffic in opaque form
        #[arg(long)]
        debug: bool,
    },
    /// Create a channel and wait for a responder
    Originator {
        #[arg(short, long)]
        relay: Option<String>,
    },
    /// Join an originator's channel
    Responder {
        #[arg(short, long)]
        relay: Option<String>,
        /// Pairing payload JSON as printed by the originator
        #[arg(long, conflicts_with_all = ["channel_id", "public_key"])]
        pairing: Option<String>,
        #[arg(long, requires = "public_key")]
        channel_id: Option<String>,
        #[arg(long, requires = "channel_id")]
        public_key: Option<String>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = match &cli.command {
        Commands::Relay { debug: true, .. } => "debug",
        Commands::Relay { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Relay { port, debug } => cmd_relay(port, debug).await,
        Commands::Originator { relay } => cmd_originator(relay).await,
        Commands::Responder {
            relay,
            pairing,
            channel_id,
            public_key,
        } => cmd_responder(relay, pairing, channel_id, public_key).await,
        Commands::Config { action } => cmd_config(action).await,
    }
}

async fn cmd_relay(port: Option<u16>, debug: bool) -> Result<()> {
    let config = config::Config::load()?;
    let port = port.unwrap_or(config.listen_port);
    let server_config = config.relay_server_config(debug);

    println!("{}", "Starting Pairlink relay...".bold());
    println!("  {} Listening on port {}", "✓".green(), port.to_string().bright_cyan());
    println!(
        "  {} Limits: {} channel ops/s, {} message ops/s per origin",
        "✓".green(),
        server_config.channel_ops_per_window,
        server_config.message_ops_per_window
    );
    if server_config.debug {
        println!("  {} Debug logging of relayed traffic", "!".yellow());
    }
    println!();

    relay_server::run(server_config, port).await
}

async fn cmd_originator(relay: Option<String>) -> Result<()> {
    let config = config::Config::load()?;
    let relay_url = relay.unwrap_or_else(|| config.relay_url.clone());

    println!("{} {}", "Relay:".bold(), relay_url.bright_cyan());
    print_help_line();

    peer::run(&relay_url, PeerRole::Originator, config.session_config("originator")).await
}

async fn cmd_responder(
    relay: Option<String>,
    pairing: Option<String>,
    channel_id: Option<String>,
    public_key: Option<String>,
) -> Result<()> {
    let config = config::Config::load()?;
    let relay_url = relay.unwrap_or_else(|| config.relay_url.clone());

    let pairing = match (pairing, channel_id, public_key) {
        (Some(json), _, _) => PairingPayload::from_json(&json).context("Invalid pairing payload")?,
        (None, Some(channel_id), Some(public_key)) => PairingPayload::new(channel_id, public_key),
        _ => anyhow::bail!("Pass --pairing, or both --channel-id and --public-key"),
    };

    println!("{} {}", "Relay:".bold(), relay_url.bright_cyan());
    print_help_line();

    peer::run(&relay_url, PeerRole::Responder(pairing), config.session_config("responder")).await
}

fn print_help_line() {
    println!(
        "{}",
        "Type to chat. Commands: /pause /resume /ping /quit".dimmed()
    );
}

async fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<22} {}", key.bright_cyan(), value);
            }

            println!();
            println!("  {} {}", "File:".dimmed(), config::Config::config_file()?.display());
        }
    }

    Ok(())
}
