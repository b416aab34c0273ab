//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - A TOML file (`BEACON_CONFIG`, else the first of the default paths that exists)
//! - Environment variables (`BEACON_*`, with `__` between nested keys,
//!   e.g. `BEACON_REDIS__URL=redis://cache:6379`)

use anyhow::{bail, Context, Result};
use beacon_core::RateQuota;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_PATH_VAR: &str = "BEACON_CONFIG";

const DEFAULT_PATHS: [&str; 3] = [
    "beacon.toml",
    "/etc/beacon/beacon.toml",
    "~/.config/beacon/beacon.toml",
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

    /// Shared store and broker.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Presence tracking.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Streaming endpoint.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Request rate limits.
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    /// Caller authentication.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Internal publish endpoint.
    #[serde(default)]
    pub publish: PublishConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Redis configuration. Without a URL everything runs in process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`.
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix for every key and channel.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Milliseconds a single Redis command may take before it counts as failed.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Seconds without a heartbeat before a user goes offline.
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold_secs: u64,

    /// Seconds between stale-presence sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Seconds a presence record is retained after its last write.
    #[serde(default = "default_record_ttl")]
    pub record_ttl_secs: u64,
}

/// Streaming endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Path of the event stream.
    #[serde(default = "default_events_path")]
    pub path: String,

    /// Keep-alive interval in milliseconds.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,

    /// Maximum chat rooms per stream.
    #[serde(default = "default_max_rooms")]
    pub max_rooms: usize,

    /// Buffered envelopes per channel before slow readers lag.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Rate limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    /// Headers set by the reverse proxy that carry the client address, in
    /// order of preference.
    #[serde(default = "default_trusted_ip_headers")]
    pub trusted_ip_headers: Vec<String>,

    /// Stream connection attempts.
    #[serde(default = "default_stream_quota")]
    pub stream: RateQuota,

    /// Presence queries and heartbeats.
    #[serde(default = "default_presence_quota")]
    pub presence: RateQuota,

    /// Internal publishes.
    #[serde(default = "default_publish_quota")]
    pub publish: RateQuota,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Header carrying the user id established by the upstream session layer.
    #[serde(default = "default_user_header")]
    pub user_header: String,
}

/// Internal publish configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Bearer token required by the publish endpoint. Unset disables it.
    #[serde(default)]
    pub token: Option<String>,
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

fn default_key_prefix() -> String {
    "beacon:".to_string()
}

fn default_command_timeout() -> u64 {
    500
}

fn default_offline_threshold() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_record_ttl() -> u64 {
    86_400 // 1 day
}

fn default_events_path() -> String {
    "/events".to_string()
}

fn default_keepalive_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_max_rooms() -> usize {
    32
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_trusted_ip_headers() -> Vec<String> {
    vec!["x-real-ip".to_string(), "x-forwarded-for".to_string()]
}

fn default_stream_quota() -> RateQuota {
    RateQuota::new(10, 60)
}

fn default_presence_quota() -> RateQuota {
    RateQuota::new(120, 60)
}

fn default_publish_quota() -> RateQuota {
    RateQuota::new(600, 60)
}

fn default_user_header() -> String {
    "x-authenticated-user".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            redis: RedisConfig::default(),
            presence: PresenceConfig::default(),
            gateway: GatewayConfig::default(),
            rate_limits: RateLimitsConfig::default(),
            auth: AuthConfig::default(),
            publish: PublishConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            offline_threshold_secs: default_offline_threshold(),
            sweep_interval_secs: default_sweep_interval(),
            record_ttl_secs: default_record_ttl(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            path: default_events_path(),
            keepalive_interval_ms: default_keepalive_interval(),
            max_rooms: default_max_rooms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            trusted_ip_headers: default_trusted_ip_headers(),
            stream: default_stream_quota(),
            presence: default_presence_quota(),
            publish: default_publish_quota(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            user_header: default_user_header(),
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

impl RedisConfig {
    /// Get the per-command time budget.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.max(1))
    }
}

impl PresenceConfig {
    /// Get the offline threshold.
    #[must_use]
    pub fn offline_threshold(&self) -> Duration {
        Duration::from_secs(self.offline_threshold_secs)
    }

    /// Get the sweep interval.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Get the record retention.
    #[must_use]
    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_secs)
    }
}

impl GatewayConfig {
    /// Get the keep-alive interval.
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

impl Config {
    /// Load configuration from the default sources.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or if
    /// an environment override has the wrong type.
    pub fn load() -> Result<Self> {
        Self::layered(Self::find_file().as_deref(), env_source())
    }

    /// Check settings that are only meaningful together.
    ///
    /// # Errors
    ///
    /// Returns an error if presence records would expire before the sweep
    /// could mark them offline.
    pub fn validate(&self) -> Result<()> {
        if self.presence.record_ttl_secs <= self.presence.offline_threshold_secs {
            bail!(
                "presence.record_ttl_secs ({}) must be greater than presence.offline_threshold_secs ({})",
                self.presence.record_ttl_secs,
                self.presence.offline_threshold_secs
            );
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
            .with_context(|| format!("Invalid bind address: {}:{}", self.host, self.port))
    }

    fn find_file() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
            return Some(PathBuf::from(shellexpand::tilde(&path).as_ref()));
        }

        DEFAULT_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    fn layered(file: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config: Self = builder
            .add_source(env)
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }
}

fn env_source() -> config::Environment {
    config::Environment::with_prefix("BEACON")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("rate_limits.trusted_ip_headers")
}
