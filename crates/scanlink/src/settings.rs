//! Settings file for the streaming client
//!
//! Settings are read from `scanlink.toml`, by default in the working directory.
//! Every section and key is optional; anything missing keeps its built-in default,
//! and command-line flags override whatever the file says.

use scanlink_network::{ReconnectPolicy, StreamerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Filename used for settings
pub const SETTINGS_FILENAME: &str = "scanlink.toml";

/// Consumer to stream to when neither the file nor the command line names one
pub const DEFAULT_URL: &str = "ws://127.0.0.1:3001";

/// Where to stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// `ws://` or `wss://` URL of the consumer
    pub url: Option<String>,
}

/// Backoff between reconnect attempts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    /// Exponential base
    pub base: Option<u32>,
    /// Longest single delay in seconds
    pub cap_secs: Option<u64>,
}

/// Liveness probing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// Seconds between probes
    pub interval_secs: Option<u64>,
}

/// Client behaviour
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Diagnostic message sent after every connect
    pub greeting: Option<String>,
}

/// Top-level settings struct, serialized as scanlink.toml
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub server: Option<ServerSettings>,
    pub reconnect: Option<ReconnectSettings>,
    pub probe: Option<ProbeSettings>,
    pub client: Option<ClientSettings>,
}

impl Settings {
    /// Load settings from a scanlink.toml file in the given directory.
    /// Returns Ok(None) if the file doesn't exist.
    pub fn load_from_dir(dir: &Path) -> Result<Option<Self>, SettingsError> {
        let path = dir.join(SETTINGS_FILENAME);
        if !path.exists() {
            return Ok(None);
        }
        Self::load_file(&path).map(Some)
    }

    /// Load settings from an explicit path; the file must exist
    pub fn load_file(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path).map_err(|e| SettingsError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let settings: Settings =
            toml::from_str(&contents).map_err(|e| SettingsError::ParseToml {
                path: path.to_path_buf(),
                source: e,
            })?;
        info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// URL from the file, if any
    pub fn server_url(&self) -> Option<&str> {
        self.server.as_ref()?.url.as_deref()
    }

    /// URL to connect to, falling back to [`DEFAULT_URL`]
    pub fn url_or_default(&self) -> &str {
        self.server_url().unwrap_or(DEFAULT_URL)
    }

    /// Client configuration with file values applied over the defaults
    pub fn streamer_config(&self) -> StreamerConfig {
        let mut config = StreamerConfig::default();

        if let Some(reconnect) = &self.reconnect {
            let defaults = ReconnectPolicy::default();
            let base = reconnect.base.unwrap_or(defaults.base());
            let cap = reconnect
                .cap_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.cap());
            config = config.with_reconnect_policy(ReconnectPolicy::new(base, cap));
        }
        if let Some(secs) = self.probe.as_ref().and_then(|p| p.interval_secs) {
            config = config.with_probe_interval(Duration::from_secs(secs.max(1)));
        }
        if let Some(greeting) = self.client.as_ref().and_then(|c| c.greeting.clone()) {
            config = config.with_greeting(greeting);
        }
        config
    }
}

/// Errors that can occur during settings operations
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML at {path}: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
}
