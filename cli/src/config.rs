// Configuration management for the Pairlink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/pairlink/config.json
// - Linux: ~/.config/pairlink/config.json
// - Windows: %APPDATA%\pairlink\config.json

use anyhow::{Context, Result};
use pairlink_core::{OriginatorInfo, RelayServerConfig, SessionConfig, WalletInfo};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Relay the peers connect to
    pub relay_url: String,

    /// Port the relay listens on
    pub listen_port: u16,

    /// Log relayed traffic (opaque form only)
    pub debug: bool,

    /// Relay rate limits
    pub limits: LimitsConfig,

    /// Identity announced when acting as originator
    pub originator: OriginatorConfig,

    /// Identity announced when acting as responder
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// create/join operations per origin per second
    pub channel_ops_per_sec: u32,

    /// message/ping operations per origin per second
    pub message_ops_per_sec: u32,

    /// Maximum origins tracked by the limiter
    pub max_tracked_origins: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginatorConfig {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    pub name: String,
    pub version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8765".to_string(),
            listen_port: 8765,
            debug: false,
            limits: LimitsConfig::default(),
            originator: OriginatorConfig {
                title: "Pairlink CLI".to_string(),
                url: "cli://pairlink".to_string(),
            },
            wallet: WalletConfig {
                name: "Pairlink".to_string(),
                version: format!("Pairlink/CLI {}", env!("CARGO_PKG_VERSION")),
            },
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let defaults = RelayServerConfig::default();
        Self {
            channel_ops_per_sec: defaults.channel_ops_per_window,
            message_ops_per_sec: defaults.message_ops_per_window,
            max_tracked_origins: defaults.max_tracked_origins,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("pairlink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents = std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            let config: Config = serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value and persist it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "relay_url" => {
                if !value.starts_with("ws://") && !value.starts_with("wss://") {
                    anyhow::bail!("Relay URL must start with ws:// or wss://");
                }
                self.relay_url = value.to_string();
            }
            "listen_port" => {
                self.listen_port = value.parse().context("Invalid port number")?;
            }
            "debug" => {
                self.debug = value.parse().context("Invalid boolean value")?;
            }
            "channel_ops_per_sec" => {
                self.limits.channel_ops_per_sec = value.parse().context("Invalid number")?;
            }
            "message_ops_per_sec" => {
                self.limits.message_ops_per_sec = value.parse().context("Invalid number")?;
            }
            "max_tracked_origins" => {
                self.limits.max_tracked_origins = value.parse().context("Invalid number")?;
            }
            "originator_title" => self.originator.title = value.to_string(),
            "originator_url" => self.originator.url = value.to_string(),
            "wallet_name" => self.wallet.name = value.to_string(),
            "wallet_version" => self.wallet.version = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("relay_url".to_string(), self.relay_url.clone()),
            ("listen_port".to_string(), self.listen_port.to_string()),
            ("debug".to_string(), self.debug.to_string()),
            ("channel_ops_per_sec".to_string(), self.limits.channel_ops_per_sec.to_string()),
            ("message_ops_per_sec".to_string(), self.limits.message_ops_per_sec.to_string()),
            ("max_tracked_origins".to_string(), self.limits.max_tracked_origins.to_string()),
            ("originator_title".to_string(), self.originator.title.clone()),
            ("originator_url".to_string(), self.originator.url.clone()),
            ("wallet_name".to_string(), self.wallet.name.clone()),
            ("wallet_version".to_string(), self.wallet.version.clone()),
        ]
    }

    /// Relay server settings derived from this config
    pub fn relay_server_config(&self, debug: bool) -> RelayServerConfig {
        RelayServerConfig {
            channel_ops_per_window: self.limits.channel_ops_per_sec,
            message_ops_per_window: self.limits.message_ops_per_sec,
            window: Duration::from_secs(1),
            max_tracked_origins: self.limits.max_tracked_origins,
            debug: debug || self.debug,
        }
    }

    /// Session settings derived from this config
    pub fn session_config(&self, context: &str) -> SessionConfig {
        SessionConfig {
            context: context.to_string(),
            originator_info: OriginatorInfo {
                url: self.originator.url.clone(),
                title: self.originator.title.clone(),
            },
            wallet_info: WalletInfo {
                wallet_type: self.wallet.name.clone(),
                version: self.wallet.version.clone(),
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_port, 8765);
        assert_eq!(config.limits.channel_ops_per_sec, 5);
        assert_eq!(config.limits.message_ops_per_sec, 50);
        assert!(!config.debug);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config.relay_url, deserialized.relay_url);
        assert_eq!(config.wallet.version, deserialized.wallet.version);
    }

    #[test]
    fn test_apply_and_get() {
        let mut config = Config::default();
        config.apply("listen_port", "9000").expect("Failed to set port");
        config.apply("wallet_name", "Test Wallet").expect("Failed to set name");

        assert_eq!(config.get("listen_port").as_deref(), Some("9000"));
        assert_eq!(config.get("wallet_name").as_deref(), Some("Test Wallet"));
        assert!(config.get("nope").is_none());
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.apply("listen_port", "lots").is_err());
        assert!(config.apply("relay_url", "http://relay").is_err());
        assert!(config.apply("unknown", "1").is_err());
    }

    #[test]
    fn test_derived_configs() {
        let config = Config::default();
        let relay = config.relay_server_config(true);
        assert!(relay.debug);
        assert_eq!(relay.channel_ops_per_window, 5);

        let session = config.session_config("originator");
        assert_eq!(session.context, "originator");
        assert_eq!(session.originator_info.title, "Pairlink CLI");
        assert_eq!(session.wallet_info.wallet_type, "Pairlink");
    }
}
