//! Configuration management for the PtyGate daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ptygate/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{OverflowPolicy, QueueConfig, SessionOptions, SpawnOptions};

/// Default address the gateway listens on.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8765";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bind_addr must be a socket address like 127.0.0.1:8765, got {0}")]
    InvalidBindAddr(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("max_sessions must be between 1 and 10000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("input_queue_capacity must be greater than 0")]
    InvalidInputCapacity,

    #[error("queue_capacity must be greater than 0")]
    InvalidQueueCapacity,

    #[error("stall_timeout_secs must be between 1 and 3600, got {0}")]
    InvalidStallTimeout(u64),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the PtyGate daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and logging configuration.
    pub server: ServerConfig,

    /// Shell session configuration.
    pub session: SessionConfig,

    /// Outbound flow control configuration.
    pub flow: FlowConfig,
}

/// Listener and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for the WebSocket and admin HTTP listener.
    pub bind_addr: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily-rolled log files. Console only when unset.
    pub log_dir: Option<PathBuf>,
}

/// Shell session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell started for every new session.
    pub default_shell: String,

    /// Initial terminal width.
    pub cols: u16,

    /// Initial terminal height.
    pub rows: u16,

    /// Working directory for new shells. Inherited from the daemon when unset.
    pub cwd: Option<PathBuf>,

    /// Extra environment variables for new shells.
    pub env: BTreeMap<String, String>,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Seconds without input or output before a session is closed (0 = never).
    pub idle_timeout_secs: u64,

    /// Milliseconds between the hangup signal and a forced kill.
    pub kill_grace_ms: u64,

    /// Pending client→shell frames per session.
    pub input_queue_capacity: usize,
}

/// Outbound flow control configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlowConfig {
    /// Outbound queue capacity in frames.
    pub queue_capacity: usize,

    /// Seconds the reader may stay blocked on a full queue before the
    /// session is closed as abandoned.
    pub stall_timeout_secs: u64,

    /// What to do when the queue is full.
    pub overflow_policy: OverflowPolicy,

    /// Milliseconds to wait for a subscriber to drain output during teardown.
    pub drain_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            cols: 80,
            rows: 24,
            cwd: None,
            env: BTreeMap::new(),
            max_sessions: 64,
            idle_timeout_secs: 1800, // 30 minutes
            kill_grace_ms: 2000,
            input_queue_capacity: 1024,
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            stall_timeout_secs: 30,
            overflow_policy: OverflowPolicy::Backpressure,
            drain_timeout_ms: 500,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptygate")
        .join("config.toml")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PTYGATE_BIND_ADDR: Override the listener address
    /// - PTYGATE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PTYGATE_SHELL: Override the default shell
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("PTYGATE_BIND_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding bind_addr from environment: {}", addr);
                self.server.bind_addr = addr;
            }
        }

        if let Ok(level) = std::env::var("PTYGATE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.server.log_level = level;
            }
        }

        if let Ok(shell) = std::env::var("PTYGATE_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding default_shell from environment: {}", shell);
                self.session.default_shell = shell;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        let shell_path = Path::new(&self.session.default_shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.session.default_shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        if self.session.cols == 0 || self.session.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.session.cols,
                rows: self.session.rows,
            });
        }

        if self.session.max_sessions < 1 || self.session.max_sessions > 10_000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.input_queue_capacity == 0 {
            return Err(ConfigError::InvalidInputCapacity);
        }

        if self.flow.queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity);
        }

        if self.flow.stall_timeout_secs < 1 || self.flow.stall_timeout_secs > 3600 {
            return Err(ConfigError::InvalidStallTimeout(self.flow.stall_timeout_secs));
        }

        Ok(())
    }

    /// Parses the configured listener address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind_addr
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddr(self.server.bind_addr.clone()))
    }

    /// Builds the runtime options every new session is spawned with.
    pub fn session_options(&self) -> SessionOptions {
        let mut env = Vec::with_capacity(self.session.env.len() + 1);
        if !self.session.env.contains_key("TERM") {
            env.push(("TERM".to_string(), "xterm-256color".to_string()));
        }
        env.extend(
            self.session
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        SessionOptions {
            spawn: SpawnOptions {
                shell: Some(self.session.default_shell.clone()),
                cols: self.session.cols,
                rows: self.session.rows,
                env,
                cwd: self.session.cwd.clone(),
            },
            queue: QueueConfig {
                capacity: self.flow.queue_capacity,
                policy: self.flow.overflow_policy,
                stall_timeout: Duration::from_secs(self.flow.stall_timeout_secs),
            },
            idle_timeout: match self.session.idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            kill_grace: Duration::from_millis(self.session.kill_grace_ms),
            drain_timeout: Duration::from_millis(self.flow.drain_timeout_ms),
            input_capacity: self.session.input_queue_capacity,
        }
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

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
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

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
