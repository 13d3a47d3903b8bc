//! Configuration management for the termbridge broker.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termbridge/broker.toml`.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Port the broker listens on when nothing else is configured.
pub const DEFAULT_PORT: u16 = 3457;

/// Default upper bound on concurrently live PTY sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 64;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u16),

    #[error("bind must be an IP address, got {0}")]
    InvalidBindAddress(String),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and logging configuration.
    pub server: ServerConfig,

    /// Session management configuration.
    pub session: SessionConfig,
}

/// Listener and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP/WebSocket listener to.
    pub bind: String,

    /// TCP port of the listener.
    pub port: u16,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for rolling log files. Logs go to stderr only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell used when a client does not name one. Falls back to `$SHELL`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_shell: Option<String>,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: None,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termbridge")
        .join("broker.toml")
}

/// Checks that a shell is usable: absolute paths must exist, bare names must
/// be found on `PATH`.
pub fn shell_exists(shell: &str) -> bool {
    let path = Path::new(shell);
    if path.is_absolute() {
        path.exists()
    } else {
        which::which(shell).is_ok()
    }
}

/// A config value read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvOverride {
    /// The variable replaced the configured value.
    Applied { var: &'static str, value: String },
    /// The variable was set but could not be used.
    Ignored { var: &'static str, value: String },
}

impl EnvOverride {
    /// Logs the override. Call once the subscriber is installed.
    pub fn log(&self) {
        match self {
            EnvOverride::Applied { var, value } => {
                tracing::info!("Overriding config from environment: {}={}", var, value)
            }
            EnvOverride::Ignored { var, value } => {
                tracing::warn!(var = *var, value = %value, "Ignoring unparsable environment value")
            }
        }
    }
}

/// Reads a port from an environment variable. Unset and empty values yield
/// `None`; unparsable ones are recorded as ignored.
fn env_port(name: &'static str, overrides: &mut Vec<EnvOverride>) -> Option<u16> {
    let value = std::env::var(name).ok()?;
    if value.is_empty() {
        return None;
    }
    match value.parse() {
        Ok(port) => Some(port),
        Err(_) => {
            overrides.push(EnvOverride::Ignored { var: name, value });
            None
        }
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMBRIDGE_PORT: listener port (wins over PORT)
    /// - PORT: listener port
    /// - TERMBRIDGE_LOG_LEVEL: log level (trace, debug, info, warn, error)
    ///
    /// Returns what was read from the environment so the caller can log it
    /// once logging is set up.
    pub fn apply_env_overrides(&mut self) -> Vec<EnvOverride> {
        let mut overrides = Vec::new();

        let port = env_port("TERMBRIDGE_PORT", &mut overrides)
            .map(|port| ("TERMBRIDGE_PORT", port))
            .or_else(|| env_port("PORT", &mut overrides).map(|port| ("PORT", port)));
        if let Some((var, port)) = port {
            self.server.port = port;
            overrides.push(EnvOverride::Applied {
                var,
                value: port.to_string(),
            });
        }

        if let Ok(level) = std::env::var("TERMBRIDGE_LOG_LEVEL") {
            if !level.is_empty() {
                self.server.log_level = level.clone();
                overrides.push(EnvOverride::Applied {
                    var: "TERMBRIDGE_LOG_LEVEL",
                    value: level,
                });
            }
        }

        overrides
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort(self.server.port));
        }

        if self.server.bind.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddress(self.server.bind.clone()));
        }

        if let Some(shell) = &self.session.default_shell {
            if !shell_exists(shell) {
                return Err(ConfigError::InvalidShellPath(shell.clone()));
            }
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
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

    /// The `host:port` string the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
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
