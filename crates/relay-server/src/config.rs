//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file (`--config <path>`, or the first of `relay.toml`,
//!   `/etc/relay/relay.toml`, `~/.config/relay/relay.toml` that exists)
//! - Environment variables (`RELAY_*`, nested keys joined by `__`, e.g.
//!   `RELAY_AUTH__JWT_SECRET`), which override the file

use anyhow::{Context, Result};
use relay_core::{bus::channels, HubConfig, DEFAULT_DEDUP_WINDOW, DEFAULT_QUEUE_CAPACITY};
use relay_protocol::MAX_FRAME_SIZE;
use relay_transport::PumpConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file locations, in lookup order.
const CONFIG_PATHS: &[&str] = &[
    "relay.toml",
    "/etc/relay/relay.toml",
    "~/.config/relay/relay.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Token validation.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Event bus wiring.
    #[serde(default)]
    pub events: EventsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of live connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Frames buffered per connection before it counts as a slow consumer.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// How long to wait for any client traffic, in milliseconds. Pings go
    /// out at nine tenths of this.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,

    /// Deadline for a single write, in milliseconds.
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,
}

/// Token validation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for HS256 tokens.
    #[serde(default)]
    pub jwt_secret: String,

    /// Required `iss` claim, if any.
    #[serde(default)]
    pub issuer: Option<String>,
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Channel patterns the bridge listens on.
    #[serde(default = "default_event_channels")]
    pub channels: Vec<String>,

    /// Recent event ids remembered for duplicate suppression.
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    MAX_FRAME_SIZE
}

fn default_outbound_queue() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_pong_wait() -> u64 {
    60_000 // 60 seconds
}

fn default_write_wait() -> u64 {
    10_000 // 10 seconds
}

fn default_event_channels() -> Vec<String> {
    channels::DEFAULT_SUBSCRIPTIONS
        .iter()
        .map(|c| (*c).to_string())
        .collect()
}

fn default_dedup_window() -> usize {
    DEFAULT_DEDUP_WINDOW
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            auth: AuthConfig::default(),
            events: EventsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            pong_wait_ms: default_pong_wait(),
            write_wait_ms: default_write_wait(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channels: default_event_channels(),
            dedup_window: default_dedup_window(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the first default location that
    /// exists, with `RELAY_*` environment overrides applied on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::discover(),
        };
        let base = match &file {
            Some(file) => Self::from_file(file)?,
            None => Self::default(),
        };

        let config = config::Config::builder()
            .add_source(config::Config::try_from(&base).context("Failed to stage file settings")?)
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("events.channels"),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        Ok(config)
    }

    /// Load configuration from a specific file, without overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    fn discover() -> Option<PathBuf> {
        CONFIG_PATHS.iter().find_map(|path| {
            let expanded = PathBuf::from(shellexpand::tilde(path).as_ref());
            expanded.exists().then_some(expanded)
        })
    }

    /// Check settings that have no usable default.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.is_empty() {
            anyhow::bail!("auth.jwt_secret must be set (RELAY_AUTH__JWT_SECRET)");
        }
        if self.heartbeat.pong_wait_ms < 10 {
            anyhow::bail!("heartbeat.pong_wait_ms is too small");
        }
        if self.limits.outbound_queue == 0 {
            anyhow::bail!("limits.outbound_queue must be at least 1");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    #[must_use]
    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig::new(
            Duration::from_millis(self.heartbeat.pong_wait_ms),
            Duration::from_millis(self.heartbeat.write_wait_ms),
            self.limits.max_message_size,
        )
    }

    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_connections: self.limits.max_connections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.limits.max_message_size, 512);
        assert_eq!(config.limits.outbound_queue, 256);
        assert_eq!(config.events.channels, vec!["room:*", "presence", "system", "global"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_pump_config_derives_ping_period() {
        let config = Config::default();
        let pump = config.pump_config();
        assert_eq!(pump.pong_wait, Duration::from_secs(60));
        assert_eq!(pump.ping_period, Duration::from_secs(54));
        assert_eq!(pump.write_wait, Duration::from_secs(10));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 50000

            [auth]
            jwt_secret = "s3cret"

            [events]
            channels = ["room:*"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.outbound_queue, 256);
        assert_eq!(config.events.channels, vec!["room:*"]);
        assert_eq!(config.events.dedup_window, 1024);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = std::env::temp_dir().join(format!("relay-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("relay.toml");
        std::fs::write(&path, "port = 7001\n[heartbeat]\npong_wait_ms = 30000\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.port, 7001);
        assert_eq!(config.pump_config().ping_period, Duration::from_secs(27));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
