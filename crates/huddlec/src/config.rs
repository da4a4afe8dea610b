use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI interface for the huddle client.
#[derive(Parser)]
#[command(name = "huddlec", about = "Huddle client")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Relay server URL override.
    #[arg(long, global = true)]
    pub relay: Option<String>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Join the room: print presence, chat and link events, send stdin lines as chat.
    Join {
        /// Display name to request from the relay.
        #[arg(long)]
        name: Option<String>,
    },
    /// Print the effective configuration and exit.
    Config,
}

/// Runtime configuration loaded from file, env, and defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the relay server.
    pub relay: String,
    /// Display name requested on connect; the relay picks one when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Reconnection backoff settings.
    pub reconnect: ReconnectConfig,
    /// WebSocket keepalive ping settings.
    pub keepalive: KeepaliveConfig,
    /// Per-peer negotiation retry settings.
    pub negotiation: NegotiationConfig,
}

/// Reconnect backoff parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnect attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between reconnect attempts, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
}

/// WebSocket keepalive settings.
#[derive(Debug, Deserialize, Clone)]
pub struct KeepaliveConfig {
    /// Interval between keepalive pings, in seconds.
    pub interval_s: u64,
}

/// Retry policy for a single peer link.
#[derive(Debug, Deserialize, Clone)]
pub struct NegotiationConfig {
    /// Consecutive failed negotiations before the link is reported lost.
    pub max_attempts: u32,
    /// Delay before the first renegotiation, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on the renegotiation delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Time a negotiation may take to reach an established path, in seconds.
    pub timeout_s: u64,
}

impl NegotiationConfig {
    /// Negotiation deadline as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay: format!("ws://127.0.0.1:{}", huddle_common::types::DEFAULT_RELAY_PORT),
            name: None,
            reconnect: ReconnectConfig::default(),
            keepalive: KeepaliveConfig::default(),
            negotiation: NegotiationConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30000,
            backoff_factor: 2.0,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self { interval_s: 30 }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 8000,
            timeout_s: 15,
        }
    }
}

impl ClientConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.relay.is_empty() {
            return Err("relay URL must not be empty".to_string());
        }
        if !(self.relay.starts_with("ws://") || self.relay.starts_with("wss://")) {
            return Err(format!(
                "relay URL must start with ws:// or wss://, got: {}",
                self.relay
            ));
        }
        if url::Url::parse(&self.relay).is_err() {
            return Err(format!("relay URL is not valid: {}", self.relay));
        }

        if let Some(name) = &self.name {
            if name.chars().count() > huddle_common::types::MAX_DISPLAY_NAME_LEN {
                return Err(format!(
                    "name must be at most {} characters",
                    huddle_common::types::MAX_DISPLAY_NAME_LEN
                ));
            }
        }

        if self.reconnect.initial_delay_ms == 0 {
            return Err("reconnect.initial_delay_ms must be greater than 0".to_string());
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err("reconnect.max_delay_ms must be >= initial_delay_ms".to_string());
        }
        if !self.reconnect.backoff_factor.is_finite() || self.reconnect.backoff_factor <= 0.0 {
            return Err(
                "reconnect.backoff_factor must be a finite number greater than 0".to_string(),
            );
        }

        if self.keepalive.interval_s == 0 {
            return Err("keepalive.interval_s must be greater than 0".to_string());
        }

        if self.negotiation.max_attempts == 0 {
            return Err("negotiation.max_attempts must be greater than 0".to_string());
        }
        if self.negotiation.initial_delay_ms == 0 {
            return Err("negotiation.initial_delay_ms must be greater than 0".to_string());
        }
        if self.negotiation.max_delay_ms < self.negotiation.initial_delay_ms {
            return Err("negotiation.max_delay_ms must be >= initial_delay_ms".to_string());
        }
        if self.negotiation.timeout_s == 0 {
            return Err("negotiation.timeout_s must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Load configuration from defaults, an optional TOML file and `HUDDLEC_*`
/// environment variables (nested keys use `__`, e.g.
/// `HUDDLEC_NEGOTIATION__MAX_ATTEMPTS`).
///
/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let defaults = ClientConfig::default();
    let mut builder = config::Config::builder()
        .set_default("relay", defaults.relay.as_str())?
        .set_default(
            "reconnect.initial_delay_ms",
            defaults.reconnect.initial_delay_ms as i64,
        )?
        .set_default(
            "reconnect.max_delay_ms",
            defaults.reconnect.max_delay_ms as i64,
        )?
        .set_default(
            "reconnect.backoff_factor",
            defaults.reconnect.backoff_factor,
        )?
        .set_default("keepalive.interval_s", defaults.keepalive.interval_s as i64)?
        .set_default(
            "negotiation.max_attempts",
            i64::from(defaults.negotiation.max_attempts),
        )?
        .set_default(
            "negotiation.initial_delay_ms",
            defaults.negotiation.initial_delay_ms as i64,
        )?
        .set_default(
            "negotiation.max_delay_ms",
            defaults.negotiation.max_delay_ms as i64,
        )?
        .set_default("negotiation.timeout_s", defaults.negotiation.timeout_s as i64)?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    } else {
        let native_path = dirs::config_dir().map(|d| d.join("huddlec").join("config.toml"));
        let xdg_path =
            dirs::home_dir().map(|d| d.join(".config").join("huddlec").join("config.toml"));

        let resolved = native_path
            .filter(|p| p.exists())
            .or_else(|| xdg_path.filter(|p| p.exists()));

        if let Some(config_path) = resolved {
            builder = builder.add_source(config::File::from(config_path));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HUDDLEC")
            .prefix_separator("_")
            .separator("__"),
    );

    let settings = builder.build()?;
    let config: ClientConfig = settings.try_deserialize()?;

    Ok(config)
}
