//! Configuration for the session engine
//!
//! Provides centralized configuration for all components. Every field has a
//! default, so a TOML file only needs to list what it changes.

use crate::stream::RequestStreamConfig;
use crate::transport::TransportConfig;
use crate::viseme::VisemeConfig;
use crate::{PanelError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding [`ServerConfig::base_url`]
pub const SERVER_ENV: &str = "LIVEBOT_SERVER";

/// Backend endpoints
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP base URL of the backend
    pub base_url: String,

    /// Path of the push channel WebSocket
    pub ws_path: String,

    /// Path of the streaming chat endpoint
    pub stream_path: String,

    /// Path of the stop endpoint
    pub stop_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            ws_path: "/ws/live2d".to_string(),
            stream_path: "/api/chat/stream".to_string(),
            stop_path: "/api/chat/stop".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct VisemeSettings {
    pub peak_amplitude: f32,
    pub default_delay_ms: f64,
    pub max_pending: usize,
}

impl Default for VisemeSettings {
    fn default() -> Self {
        let defaults = VisemeConfig::default();
        Self {
            peak_amplitude: defaults.peak_amplitude,
            default_delay_ms: defaults.default_delay_ms,
            max_pending: defaults.max_pending,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    /// Messages kept in memory
    pub max_messages: usize,

    /// Settled messages written to the snapshot
    pub max_persisted: usize,

    /// Snapshot file; history is not persisted when unset
    pub snapshot_path: Option<PathBuf>,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            max_messages: 100,
            max_persisted: 500,
            snapshot_path: None,
        }
    }
}

/// Configuration for the complete panel
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub server: ServerConfig,
    pub transport: TransportSettings,
    pub viseme: VisemeSettings,
    pub history: HistorySettings,

    /// Prior settled messages sent along with a typed turn
    pub context_messages: usize,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            transport: TransportSettings::default(),
            viseme: VisemeSettings::default(),
            history: HistorySettings::default(),
            context_messages: 20,
        }
    }
}

impl PanelConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| PanelError::ConfigError(e.to_string()))
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PanelError::ConfigError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply overrides from the environment
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(SERVER_ENV) {
            if !url.trim().is_empty() {
                self.server.base_url = url.trim().to_string();
            }
        }
        self
    }

    /// Set the backend base URL
    pub fn with_server(mut self, base_url: impl Into<String>) -> Self {
        self.server.base_url = base_url.into();
        self
    }

    /// Persist history to a JSON file
    pub fn with_history_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.history.snapshot_path = Some(path.into());
        self
    }

    /// Keep history in memory only
    pub fn without_persistence(mut self) -> Self {
        self.history.snapshot_path = None;
        self
    }

    fn base(&self) -> &str {
        self.server.base_url.trim_end_matches('/')
    }

    /// WebSocket URL derived from the HTTP base URL
    pub fn ws_url(&self) -> String {
        let base = self.base();
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}{}", ws_base, self.server.ws_path)
    }

    pub fn stream_url(&self) -> String {
        format!("{}{}", self.base(), self.server.stream_path)
    }

    pub fn stop_url(&self) -> String {
        format!("{}{}", self.base(), self.server.stop_path)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            url: self.ws_url(),
            base_delay: Duration::from_millis(self.transport.base_delay_ms),
            max_retries: self.transport.max_retries,
        }
    }

    pub fn request_stream_config(&self) -> RequestStreamConfig {
        RequestStreamConfig {
            stream_url: self.stream_url(),
            stop_url: self.stop_url(),
        }
    }

    pub fn viseme_config(&self) -> VisemeConfig {
        VisemeConfig {
            peak_amplitude: self.viseme.peak_amplitude,
            default_delay_ms: self.viseme.default_delay_ms,
            max_pending: self.viseme.max_pending,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let base = self.base();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(PanelError::ConfigError(format!(
                "Server URL must start with http:// or https://, got {:?}",
                self.server.base_url
            )));
        }

        for (name, path) in [
            ("ws_path", &self.server.ws_path),
            ("stream_path", &self.server.stream_path),
            ("stop_path", &self.server.stop_path),
        ] {
            if !path.starts_with('/') {
                return Err(PanelError::ConfigError(format!(
                    "{} must start with '/', got {:?}",
                    name, path
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.viseme.peak_amplitude) {
            return Err(PanelError::ConfigError(format!(
                "Peak amplitude must be within 0..=1, got {}",
                self.viseme.peak_amplitude
            )));
        }

        if self.history.max_messages == 0 {
            return Err(PanelError::ConfigError(
                "history.max_messages must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
