//! Agent identity.
//!
//! The device id is random at first run and persisted in the config file;
//! the display name is user-editable and may change at any time.

use std::path::Path;

use serde::Serialize;

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};

/// Version string baked into the binary.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// This device's stable identity.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    /// Stable id, 8 hex chars.
    pub id: String,
    /// User-editable display name.
    pub name: String,
    /// Platform tag.
    pub platform: String,
    /// Agent software version.
    pub version: String,
}

impl AgentIdentity {
    /// Load the identity from config, generating and persisting a fresh id
    /// on first run.
    ///
    /// # Errors
    ///
    /// Returns an error if the generated id cannot be persisted.
    pub fn ensure(config: &mut AgentConfig, config_path: &Path) -> Result<Self> {
        let id = match &config.agent.id {
            Some(id) => id.clone(),
            None => {
                let id = generate_agent_id()?;
                config.agent.id = Some(id.clone());
                config.save(config_path)?;
                tracing::info!(agent_id = %id, "generated agent identity");
                id
            }
        };

        Ok(Self {
            id,
            name: config.agent.name.clone(),
            platform: config.agent.platform.clone(),
            version: AGENT_VERSION.to_string(),
        })
    }

    /// Identity and port exposed to the external discovery advertiser.
    #[must_use]
    pub fn advertisement(&self, port: u16) -> Advertisement {
        Advertisement {
            id: self.id.clone(),
            name: self.name.clone(),
            platform: self.platform.clone(),
            version: self.version.clone(),
            port,
        }
    }
}

/// What the discovery layer advertises on the LAN. The core exposes this
/// record; it does not perform the advertisement itself.
#[derive(Debug, Clone, Serialize)]
pub struct Advertisement {
    /// Agent id.
    pub id: String,
    /// Agent display name.
    pub name: String,
    /// Platform tag.
    pub platform: String,
    /// Agent software version.
    pub version: String,
    /// Bound listening port.
    pub port: u16,
}

/// Generate a random 8-hex-char device id from the OS CSPRNG.
fn generate_agent_id() -> Result<String> {
    let mut buf = [0u8; 4];
    getrandom::getrandom(&mut buf)
        .map_err(|_| AgentError::Fatal("OS CSPRNG unavailable".into()))?;
    Ok(hex::encode(buf))
}
