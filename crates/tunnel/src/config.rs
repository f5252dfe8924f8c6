//! Configuration management for tunnel-cli.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ctrl-tunnel/config.toml`.
//!
//! A loaded [`Config`] is turned into the immutable values each component
//! takes: [`SessionOptions`] for sessions and [`SignalingConfig`] for the
//! relay client.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::controller::{PollPolicy, DEFAULT_OFFER_POLL_ATTEMPTS};
use crate::network::negotiator::{NegotiatorOptions, DEFAULT_GATHER_TIMEOUT};
use crate::network::signaling::{DEFAULT_ORIGIN, DEFAULT_SIGNALING_URL};
use crate::network::{IceServer, SignalingConfig};
use crate::session::SessionOptions;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("controller base_url must start with http:// or https://, got {0}")]
    InvalidControllerUrl(String),

    #[error("signaling url must start with ws:// or wss://, got {0}")]
    InvalidSignalingUrl(String),

    #[error("offer_poll_attempts must be at least 1")]
    InvalidPollAttempts,

    #[error("{0} must be greater than 0")]
    ZeroDuration(&'static str),

    #[error("turn server {0} needs turn_username and turn_password")]
    MissingTurnCredentials(String),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Controller REST endpoint.
    pub controller: ControllerConfig,

    /// Signaling relay.
    pub signaling: SignalingSection,

    /// Session timers.
    pub session: SessionConfig,

    /// Peer transport settings.
    pub transport: TransportConfig,

    /// Log output.
    pub logging: LoggingConfig,
}

/// Controller REST endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    pub base_url: String,

    /// Controller site name.
    pub site: String,

    /// Pre-authenticated session cookie.
    pub cookie: Option<String>,

    /// Skip TLS certificate verification (self-signed controllers).
    pub accept_invalid_certs: bool,
}

/// Signaling relay settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalingSection {
    pub url: String,

    pub origin: Option<String>,

    pub cookie: Option<String>,

    /// Heartbeat interval in milliseconds.
    pub ping_interval_ms: u64,
}

/// Session timers, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout_ms: u64,

    /// Idle auto-close period; 0 disables it.
    pub autoclose_ms: u64,

    pub expect_timeout_ms: u64,

    pub request_timeout_ms: u64,

    /// Session time-to-live passed to the controller.
    pub ttl: String,
}

/// Peer transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// STUN server URLs. With no STUN or TURN servers, credentials are
    /// requested from the controller.
    pub stun_servers: Vec<String>,

    pub turn_servers: Vec<String>,

    pub turn_username: Option<String>,

    pub turn_password: Option<String>,

    pub gather_timeout_ms: u64,

    pub offer_poll_attempts: u32,

    pub offer_poll_interval_ms: u64,
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// When set, logs also go to a daily rolling file in this directory.
    pub directory: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://127.0.0.1:8443".to_string(),
            site: "default".to_string(),
            cookie: None,
            accept_invalid_certs: false,
        }
    }
}

impl Default for SignalingSection {
    fn default() -> Self {
        Self {
            url: DEFAULT_SIGNALING_URL.to_string(),
            origin: Some(DEFAULT_ORIGIN.to_string()),
            cookie: None,
            ping_interval_ms: 10_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            autoclose_ms: 30_000,
            expect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            ttl: "-1".to_string(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            turn_username: None,
            turn_password: None,
            gather_timeout_ms: DEFAULT_GATHER_TIMEOUT.as_millis() as u64,
            offer_poll_attempts: DEFAULT_OFFER_POLL_ATTEMPTS,
            offer_poll_interval_ms: 2_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ctrl-tunnel")
        .join("config.toml")
}

impl TransportConfig {
    /// Configured STUN and TURN servers.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers: Vec<IceServer> =
            self.stun_servers.iter().map(IceServer::stun).collect();

        for url in &self.turn_servers {
            servers.push(IceServer {
                urls: vec![url.clone()],
                username: self.turn_username.clone(),
                credential: self.turn_password.clone(),
            });
        }
        servers
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - CTRL_TUNNEL_CONTROLLER_URL: Override the controller base URL
    /// - CTRL_TUNNEL_SIGNALING_URL: Override the relay URL
    /// - CTRL_TUNNEL_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - CTRL_TUNNEL_COOKIE: Session cookie for both controller and relay
    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = non_empty_var("CTRL_TUNNEL_CONTROLLER_URL") {
            tracing::info!("Overriding controller base_url from environment: {}", url);
            self.controller.base_url = url;
        }

        if let Some(url) = non_empty_var("CTRL_TUNNEL_SIGNALING_URL") {
            tracing::info!("Overriding signaling url from environment: {}", url);
            self.signaling.url = url;
        }

        if let Some(level) = non_empty_var("CTRL_TUNNEL_LOG_LEVEL") {
            tracing::info!("Overriding log level from environment: {}", level);
            self.logging.level = level;
        }

        if let Some(cookie) = non_empty_var("CTRL_TUNNEL_COOKIE") {
            tracing::info!("Using session cookie from environment");
            self.controller.cookie = Some(cookie.clone());
            self.signaling.cookie = Some(cookie);
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = &self.controller.base_url;
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(ConfigError::InvalidControllerUrl(base.clone()));
        }

        let url = &self.signaling.url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConfigError::InvalidSignalingUrl(url.clone()));
        }

        if self.transport.offer_poll_attempts == 0 {
            return Err(ConfigError::InvalidPollAttempts);
        }

        for (name, value) in [
            ("connect_timeout_ms", self.session.connect_timeout_ms),
            ("expect_timeout_ms", self.session.expect_timeout_ms),
            ("request_timeout_ms", self.session.request_timeout_ms),
            ("gather_timeout_ms", self.transport.gather_timeout_ms),
            ("ping_interval_ms", self.signaling.ping_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroDuration(name));
            }
        }

        if let Some(turn) = self.transport.turn_servers.first() {
            if self.transport.turn_username.is_none() || self.transport.turn_password.is_none() {
                return Err(ConfigError::MissingTurnCredentials(turn.clone()));
            }
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Per-session settings derived from this configuration.
    pub fn session_options(&self) -> SessionOptions {
        let session = &self.session;
        let transport = &self.transport;

        SessionOptions {
            connect_timeout: Duration::from_millis(session.connect_timeout_ms),
            autoclose: (session.autoclose_ms > 0)
                .then(|| Duration::from_millis(session.autoclose_ms)),
            expect_timeout: Duration::from_millis(session.expect_timeout_ms),
            request_timeout: Duration::from_millis(session.request_timeout_ms),
            ttl: session.ttl.clone(),
            ice_servers: transport.ice_servers(),
            negotiator: NegotiatorOptions {
                gather_timeout: Duration::from_millis(transport.gather_timeout_ms),
                poll: PollPolicy {
                    attempts: transport.offer_poll_attempts,
                    interval: Duration::from_millis(transport.offer_poll_interval_ms),
                },
            },
        }
    }

    /// Relay client settings derived from this configuration.
    pub fn signaling_config(&self) -> SignalingConfig {
        SignalingConfig::new(self.signaling.url.clone())
            .with_origin(self.signaling.origin.clone())
            .with_cookie(self.signaling.cookie.clone())
            .with_ping_interval(Duration::from_millis(self.signaling.ping_interval_ms))
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
