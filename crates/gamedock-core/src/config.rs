//! Agent configuration persisted as TOML.
//!
//! The configuration survives restarts and is the only process surface
//! besides start/stop: there is no interactive command interface.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Agent configuration (`agent.toml`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    /// Device identity settings.
    pub agent: AgentSection,
    /// Network settings.
    pub network: NetworkConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Pairing settings.
    pub pairing: PairingSection,
    /// Telemetry and console-log streaming settings. Absent in configs
    /// written before the section existed.
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

/// Device identity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Stable device id, generated at first run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// User-editable display name.
    #[serde(default = "default_agent_name")]
    pub name: String,
    /// Platform tag advertised to hubs.
    #[serde(default = "default_platform")]
    pub platform: String,
    /// Whether the agent accepts hub connections at all.
    #[serde(default = "default_true")]
    pub accept_connections: bool,
}

/// Network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Listen address. Port 0 lets the OS pick; the bound port is exposed
    /// through the discovery boundary.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory completed games are installed under.
    #[serde(default = "default_install_root")]
    pub install_root: PathBuf,
    /// Idle seconds before a silent upload session is reaped.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
}

/// Pairing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingSection {
    /// Pairing code lifetime in seconds.
    #[serde(default = "default_code_ttl_secs")]
    pub code_ttl_secs: u64,
    /// Consecutive failures before lockout.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Lockout duration in seconds once the threshold is crossed.
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,
}

/// Telemetry and console-log streaming settings.
///
/// The agent only advertises these in its handshake status; the
/// collectors that sample hardware counters and tail the console log are
/// host-platform integrations living behind the action-layer boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySection {
    /// Whether hardware telemetry streaming is offered to hubs.
    #[serde(default)]
    pub enabled: bool,
    /// Sampling interval in seconds.
    #[serde(default = "default_telemetry_interval_secs")]
    pub interval_secs: u64,
    /// Whether console-log streaming is offered to hubs.
    #[serde(default)]
    pub console_log_enabled: bool,
}

// Default values

fn default_agent_name() -> String {
    "Gamedock Device".to_string()
}

fn default_platform() -> String {
    std::env::consts::OS.to_string()
}

fn default_true() -> bool {
    true
}

fn default_listen_addr() -> String {
    "0.0.0.0:0".to_string()
}

fn default_install_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("Games")
}

fn default_session_idle_secs() -> u64 {
    120
}

fn default_code_ttl_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    5
}

fn default_lockout_secs() -> u64 {
    300
}

fn default_telemetry_interval_secs() -> u64 {
    2
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: None,
            name: default_agent_name(),
            platform: default_platform(),
            accept_connections: true,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            install_root: default_install_root(),
            session_idle_secs: default_session_idle_secs(),
        }
    }
}

impl Default for PairingSection {
    fn default() -> Self {
        Self {
            code_ttl_secs: default_code_ttl_secs(),
            max_attempts: default_max_attempts(),
            lockout_secs: default_lockout_secs(),
        }
    }
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_telemetry_interval_secs(),
            console_log_enabled: false,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Fatal`] if the file cannot be read or parsed:
    /// a broken config must not silently fall back to defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .map_err(|e| AgentError::Fatal(format!("cannot read config: {e}").into()))?;
        toml::from_str(&contents)
            .map_err(|e| AgentError::Fatal(format!("cannot parse config: {e}").into()))
    }

    /// Save configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Storage`] if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| AgentError::Storage(format!("cannot serialize config: {e}")))?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Default state directory (`<config dir>/gamedock`).
    #[must_use]
    pub fn default_state_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("gamedock")
    }

    /// Default config file location.
    #[must_use]
    pub fn default_path() -> PathBuf {
        Self::default_state_dir().join("agent.toml")
    }

    /// Load from the given path, or write defaults there on first run.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Parse the listen address.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Fatal`] on an unparseable address.
    pub fn parse_listen_addr(&self) -> Result<SocketAddr> {
        self.network
            .listen_addr
            .parse()
            .map_err(|e| AgentError::Fatal(format!("invalid listen address: {e}").into()))
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Fatal`] on invalid values.
    pub fn validate(&self) -> Result<()> {
        self.parse_listen_addr()?;

        if self.agent.name.trim().is_empty() {
            return Err(AgentError::Fatal("agent name must not be empty".into()));
        }
        if self.pairing.max_attempts == 0 {
            return Err(AgentError::Fatal(
                "pairing.max_attempts must be at least 1".into(),
            ));
        }
        if self.pairing.code_ttl_secs == 0 {
            return Err(AgentError::Fatal(
                "pairing.code_ttl_secs must be at least 1".into(),
            ));
        }
        if self.storage.install_root.as_os_str().is_empty() {
            return Err(AgentError::Fatal("install_root must not be empty".into()));
        }
        if self.telemetry.interval_secs == 0 {
            return Err(AgentError::Fatal(
                "telemetry.interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
