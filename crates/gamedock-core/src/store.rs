//! Persisted hub authorization store.
//!
//! One record per paired hub, written to `hubs.json` with temp-then-rename
//! so a crash mid-write never corrupts the store. Raw token values are
//! never logged; logging uses [`HubToken::fingerprint`].

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{AgentError, Result};

/// A bearer token minted at pairing time.
///
/// Comparison is constant-time; `Debug` prints a BLAKE3 fingerprint, not
/// the token.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct HubToken(String);

impl HubToken {
    /// Wrap an existing token string.
    #[must_use]
    pub fn new(token: String) -> Self {
        Self(token)
    }

    /// Mint a fresh 32-byte token, hex-encoded.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Fatal`] if the OS CSPRNG fails.
    pub fn mint() -> Result<Self> {
        let mut buf = [0u8; 32];
        getrandom::getrandom(&mut buf)
            .map_err(|_| AgentError::Fatal("OS CSPRNG unavailable".into()))?;
        Ok(Self(hex::encode(buf)))
    }

    /// Constant-time equality against a presented token string.
    #[must_use]
    pub fn matches(&self, presented: &str) -> bool {
        // Length is not secret; content comparison must not short-circuit.
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }

    /// Short BLAKE3 fingerprint for logs.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(&blake3::hash(self.0.as_bytes()).as_bytes()[..4])
    }

    /// The raw token value, for sending to the hub exactly once at pairing.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for HubToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HubToken({})", self.fingerprint())
    }
}

/// One persisted record per paired hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedHub {
    /// Hub display name.
    pub name: String,
    /// Hub platform tag.
    pub platform: String,
    /// Bearer token.
    pub token: HubToken,
    /// Pairing time, unix seconds.
    pub paired_at: u64,
}

/// Persisted mapping of hub ids to authorization records.
///
/// All mutation goes through this type; external readers must use the
/// pairing manager API rather than touching the file.
pub struct TokenStore {
    path: PathBuf,
    hubs: HashMap<String, AuthorizedHub>,
}

impl TokenStore {
    /// Open the store, loading existing records if the file exists.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Fatal`] if the file exists but cannot be read
    /// or parsed: an unreadable trust store must stop the process rather
    /// than silently dropping pairings.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let hubs = if path.exists() {
            let contents = fs::read_to_string(&path)
                .map_err(|e| AgentError::Fatal(format!("cannot read hub store: {e}").into()))?;
            serde_json::from_str(&contents)
                .map_err(|e| AgentError::Fatal(format!("cannot parse hub store: {e}").into()))?
        } else {
            HashMap::new()
        };

        Ok(Self { path, hubs })
    }

    /// Insert or replace the record for a hub and persist.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Storage`] if persisting fails; the in-memory
    /// map is left unchanged in that case.
    pub fn insert(&mut self, hub_id: String, record: AuthorizedHub) -> Result<()> {
        let previous = self.hubs.insert(hub_id.clone(), record);
        if let Err(e) = self.persist() {
            // Roll back so memory and disk stay consistent.
            match previous {
                Some(prev) => self.hubs.insert(hub_id, prev),
                None => self.hubs.remove(&hub_id),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Remove a hub's record and persist. Returns true if a record existed.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Storage`] if persisting fails.
    pub fn remove(&mut self, hub_id: &str) -> Result<bool> {
        let removed = self.hubs.remove(hub_id);
        let existed = removed.is_some();
        if let Err(e) = self.persist() {
            if let Some(prev) = removed {
                self.hubs.insert(hub_id.to_string(), prev);
            }
            return Err(e);
        }
        Ok(existed)
    }

    /// Look up a hub's record.
    #[must_use]
    pub fn get(&self, hub_id: &str) -> Option<&AuthorizedHub> {
        self.hubs.get(hub_id)
    }

    /// Constant-time token verification for a hub.
    #[must_use]
    pub fn verify(&self, hub_id: &str, presented: &str) -> bool {
        match self.hubs.get(hub_id) {
            Some(record) => record.token.matches(presented),
            None => false,
        }
    }

    /// All paired hubs with their ids.
    #[must_use]
    pub fn list(&self) -> Vec<(String, AuthorizedHub)> {
        self.hubs
            .iter()
            .map(|(id, rec)| (id.clone(), rec.clone()))
            .collect()
    }

    /// Number of paired hubs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hubs.len()
    }

    /// True if no hub has ever paired.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hubs.is_empty()
    }

    /// Write the store atomically: temp file in the same directory, then
    /// rename over the target.
    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_vec_pretty(&self.hubs)
            .map_err(|e| AgentError::Storage(format!("cannot serialize hub store: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &contents)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
