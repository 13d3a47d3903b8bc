//! Persisted client settings.
//!
//! Settings live in `~/.config/termbridge/settings.toml`. Missing keys take
//! their defaults, and every change made through [`SettingsStore`] is written
//! back immediately.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Port the supervisor launches the broker on by default.
pub const DEFAULT_PORT: u16 = 3457;

/// Errors raised while loading or persisting settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file: {0}")]
    Parse(String),

    #[error("failed to serialize settings: {0}")]
    Serialize(String),

    #[error("server_url is not a valid URL: {0}")]
    InvalidUrl(String),

    #[error("no configuration directory available")]
    NoConfigDir,
}

/// Where the supervisor finds the cargo runtime.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RuntimePath {
    /// Probe the usual locations.
    #[default]
    Auto,
    /// Use exactly this path.
    Explicit(PathBuf),
}

impl From<String> for RuntimePath {
    fn from(value: String) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            RuntimePath::Auto
        } else {
            RuntimePath::Explicit(PathBuf::from(trimmed))
        }
    }
}

impl From<RuntimePath> for String {
    fn from(value: RuntimePath) -> Self {
        match value {
            RuntimePath::Auto => "auto".to_string(),
            RuntimePath::Explicit(path) => path.to_string_lossy().into_owned(),
        }
    }
}

/// Timing knobs for the supervisor and controller, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Quiet period before a viewport change becomes a resize.
    pub resize_debounce_ms: u64,
    /// How long a freshly spawned broker must stay alive.
    pub spawn_check_ms: u64,
    /// Delay between a surviving spawn and the health probe.
    pub verify_grace_ms: u64,
    /// Timeout of a single health request.
    pub health_timeout_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            resize_debounce_ms: 100,
            spawn_check_ms: 1500,
            verify_grace_ms: 3000,
            health_timeout_ms: 2000,
        }
    }
}

impl TimingSettings {
    pub fn resize_debounce(&self) -> Duration {
        Duration::from_millis(self.resize_debounce_ms)
    }

    pub fn spawn_check(&self) -> Duration {
        Duration::from_millis(self.spawn_check_ms)
    }

    pub fn verify_grace(&self) -> Duration {
        Duration::from_millis(self.verify_grace_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

/// User-facing client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// WebSocket URL of the broker.
    pub server_url: String,

    /// Shell to request. The broker picks one when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,

    /// Working directory to request. The broker uses home when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Emulator font size in pixels.
    pub font_size: f32,

    /// Launch the broker automatically when the host starts.
    pub auto_start: bool,

    /// Port the broker is launched on.
    pub port: u16,

    /// `"auto"` or an explicit path to the cargo executable.
    pub runtime_path: RuntimePath,

    pub timing: TimingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: format!("ws://127.0.0.1:{}/", DEFAULT_PORT),
            shell: None,
            cwd: None,
            font_size: 14.0,
            auto_start: true,
            port: DEFAULT_PORT,
            runtime_path: RuntimePath::Auto,
            timing: TimingSettings::default(),
        }
    }
}

impl Settings {
    /// Parse settings from TOML, merging in defaults for missing keys.
    pub fn from_toml(contents: &str) -> Result<Self, SettingsError> {
        toml::from_str(contents).map_err(|e| SettingsError::Parse(e.message().to_string()))
    }

    /// Serialize settings to TOML.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(|e| SettingsError::Serialize(e.to_string()))
    }

    /// Change the launch port, rewriting the port of `server_url` to match.
    pub fn set_port(&mut self, port: u16) -> Result<(), SettingsError> {
        let mut url = self.parsed_url()?;
        url.set_port(Some(port))
            .map_err(|_| SettingsError::InvalidUrl(self.server_url.clone()))?;
        self.server_url = url.to_string();
        self.port = port;
        Ok(())
    }

    /// The `GET /health` URL of the broker named by `server_url`.
    pub fn health_url(&self) -> Result<String, SettingsError> {
        let mut url = self.parsed_url()?;
        let scheme = match url.scheme() {
            "wss" | "https" => "https",
            _ => "http",
        };
        url.set_scheme(scheme)
            .map_err(|_| SettingsError::InvalidUrl(self.server_url.clone()))?;
        url.set_path("/health");
        url.set_query(None);
        Ok(url.to_string())
    }

    fn parsed_url(&self) -> Result<Url, SettingsError> {
        Url::parse(&self.server_url).map_err(|_| SettingsError::InvalidUrl(self.server_url.clone()))
    }
}

/// Default settings location.
pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    dirs::config_dir()
        .map(|dir| dir.join("termbridge").join("settings.toml"))
        .ok_or(SettingsError::NoConfigDir)
}

/// Settings bound to the file they persist to.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    settings: Settings,
}

impl SettingsStore {
    /// Load settings from `path`. A missing file yields defaults and is not
    /// created until the first change.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let settings = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|source| SettingsError::Read {
                path: path.clone(),
                source,
            })?;
            Settings::from_toml(&contents)?
        } else {
            tracing::debug!("Settings file not found at {:?}, using defaults", path);
            Settings::default()
        };
        Ok(Self { path, settings })
    }

    /// Load settings from [`default_settings_path`].
    pub fn load_default() -> Result<Self, SettingsError> {
        Self::load(default_settings_path()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Apply `change` and persist the result.
    ///
    /// The in-memory settings are left untouched when `change` fails.
    pub fn update<F>(&mut self, change: F) -> Result<(), SettingsError>
    where
        F: FnOnce(&mut Settings) -> Result<(), SettingsError>,
    {
        let mut next = self.settings.clone();
        change(&mut next)?;
        write_settings(&self.path, &next)?;
        self.settings = next;
        Ok(())
    }

    /// Change the launch port and the URL port together.
    pub fn set_port(&mut self, port: u16) -> Result<(), SettingsError> {
        self.update(|settings| settings.set_port(port))
    }

    /// Write the current settings to disk.
    pub fn save(&self) -> Result<(), SettingsError> {
        write_settings(&self.path, &self.settings)
    }
}

fn write_settings(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let write_err = |source| SettingsError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    fs::write(path, settings.to_toml()?).map_err(write_err)?;
    tracing::debug!("Settings saved to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server_url, "ws://127.0.0.1:3457/");
        assert_eq!(settings.port, 3457);
        assert!(settings.auto_start);
        assert_eq!(settings.runtime_path, RuntimePath::Auto);
        assert_eq!(settings.timing.resize_debounce(), Duration::from_millis(100));
        assert_eq!(settings.timing.spawn_check(), Duration::from_millis(1500));
        assert_eq!(settings.timing.verify_grace(), Duration::from_millis(3000));
        assert_eq!(settings.timing.health_timeout(), Duration::from_millis(2000));
    }

    #[test]
    fn test_partial_toml_merges_defaults() {
        let settings = Settings::from_toml(
            r#"
            shell = "/bin/zsh"
            font_size = 16.0

            [timing]
            spawn_check_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(settings.shell.as_deref(), Some("/bin/zsh"));
        assert_eq!(settings.font_size, 16.0);
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.timing.spawn_check_ms, 500);
        assert_eq!(settings.timing.verify_grace_ms, 3000);
    }

    #[test]
    fn test_runtime_path_strings() {
        let auto = Settings::from_toml(r#"runtime_path = "auto""#).unwrap();
        assert_eq!(auto.runtime_path, RuntimePath::Auto);

        let explicit = Settings::from_toml(r#"runtime_path = "/opt/cargo/bin/cargo""#).unwrap();
        assert_eq!(
            explicit.runtime_path,
            RuntimePath::Explicit(PathBuf::from("/opt/cargo/bin/cargo"))
        );

        let toml = explicit.to_toml().unwrap();
        assert!(toml.contains(r#"runtime_path = "/opt/cargo/bin/cargo""#));
    }

    #[test]
    fn test_set_port_rewrites_url() {
        let mut settings = Settings::default();
        settings.set_port(4000).unwrap();
        assert_eq!(settings.port, 4000);
        assert_eq!(settings.server_url, "ws://127.0.0.1:4000/");

        settings.server_url = "ws://localhost:9000/term".to_string();
        settings.set_port(4100).unwrap();
        assert_eq!(settings.server_url, "ws://localhost:4100/term");
    }

    #[test]
    fn test_set_port_rejects_invalid_url() {
        let mut settings = Settings {
            server_url: "not a url".to_string(),
            ..Settings::default()
        };
        assert!(matches!(
            settings.set_port(4000),
            Err(SettingsError::InvalidUrl(_))
        ));
        assert_eq!(settings.port, DEFAULT_PORT);
    }

    #[test]
    fn test_health_url() {
        let mut settings = Settings::default();
        assert_eq!(settings.health_url().unwrap(), "http://127.0.0.1:3457/health");

        settings.server_url = "wss://example.test:8443/socket?x=1".to_string();
        assert_eq!(
            settings.health_url().unwrap(),
            "https://example.test:8443/health"
        );
    }

    #[test]
    fn test_store_missing_file_uses_defaults_without_writing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("termbridge").join("settings.toml");

        let store = SettingsStore::load(&path).unwrap();
        assert_eq!(store.settings(), &Settings::default());
        assert!(!path.exists());
    }

    #[test]
    fn test_store_persists_every_change() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("termbridge").join("settings.toml");

        let mut store = SettingsStore::load(&path).unwrap();
        store.set_port(4321).unwrap();
        store
            .update(|s| {
                s.shell = Some("/bin/bash".to_string());
                Ok(())
            })
            .unwrap();

        let reloaded = SettingsStore::load(&path).unwrap();
        assert_eq!(reloaded.settings().port, 4321);
        assert_eq!(reloaded.settings().server_url, "ws://127.0.0.1:4321/");
        assert_eq!(reloaded.settings().shell.as_deref(), Some("/bin/bash"));
    }

    #[test]
    fn test_failed_update_changes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.toml");

        let mut store = SettingsStore::load(&path).unwrap();
        let result = store.update(|s| {
            s.font_size = 30.0;
            Err(SettingsError::InvalidUrl("x".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(store.settings().font_size, 14.0);
        assert!(!path.exists());
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.toml");
        fs::write(&path, "port = \"not a number\"").unwrap();

        assert!(matches!(
            SettingsStore::load(&path),
            Err(SettingsError::Parse(_))
        ));
    }
}
