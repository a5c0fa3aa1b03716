//! Agent configuration.
//!
//! Loaded from TOML; every section and key is optional. Command-line and
//! environment overrides are applied by the binary before [`AgentConfig::validate`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::ReconnectPolicy;
use crate::session::SessionConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub session: SessionSettings,
    pub stream: StreamSettings,
    pub resources: ResourceConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Control-plane base address.
    pub base_url: String,
    /// Stable node identifier used for login and report paths.
    pub serial_number: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            serial_number: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub login_retry_secs: u64,
    pub connect_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            login_retry_secs: 5,
            connect_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectMode {
    /// Retry with exponential backoff before invalidating the token.
    #[default]
    Backoff,
    /// Invalidate the token on the first stream termination.
    Immediate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub mode: ReconnectMode,
    /// Reconnect attempts after a stream ends, in `backoff` mode. `0` behaves
    /// like `mode = "immediate"`; `1` still reconnects once.
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub settle_delay_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            mode: ReconnectMode::Backoff,
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            settle_delay_ms: 3000,
        }
    }
}

impl StreamSettings {
    pub fn policy(&self) -> ReconnectPolicy {
        match self.mode {
            ReconnectMode::Immediate => ReconnectPolicy::invalidate_on_disconnect(),
            ReconnectMode::Backoff => ReconnectPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                settle_delay: Duration::from_millis(self.settle_delay_ms),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub path: PathBuf,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./res"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub shadow_interval_secs: u64,
    pub metadata_interval_secs: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            shadow_interval_secs: 10,
            metadata_interval_secs: 60,
        }
    }
}

impl AgentConfig {
    /// Reads `path`, or returns defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.server.base_url = self
            .server
            .base_url
            .trim()
            .trim_end_matches('/')
            .to_string();
        let base_url = &self.server.base_url;
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "server.base_url must be http(s), got '{base_url}'"
            )));
        }

        self.server.serial_number = self.server.serial_number.trim().to_string();
        if self.server.serial_number.is_empty() {
            return Err(ConfigError::Invalid(
                "server.serial_number is required".to_string(),
            ));
        }

        if self.stream.max_delay_ms < self.stream.base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "stream.max_delay_ms ({}) is below stream.base_delay_ms ({})",
                self.stream.max_delay_ms, self.stream.base_delay_ms
            )));
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(&self.server.base_url, &self.server.serial_number);
        config.login_retry = Duration::from_secs(self.session.login_retry_secs);
        config.reconnect = self.stream.policy();
        config
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.session.connect_timeout_ms)
    }
}
