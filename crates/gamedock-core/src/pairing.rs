//! Pairing codes, lockout, and token management for hub authentication.
//!
//! Pairing codes are the only secret a human verifies visually, so they
//! are short-lived, drawn from the OS CSPRNG, and rate-limited
//! independently of any single connection's lifetime: reconnecting does
//! not reset the failure counter, and while locked out the submitted code
//! is never compared at all.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, RwLock};
use zeroize::Zeroizing;

use crate::config::PairingSection;
use crate::error::{AgentError, Result};
use crate::events::{EventQueue, Topic};
use crate::store::{AuthorizedHub, HubToken, TokenStore};

/// Number of decimal digits in a pairing code.
pub const PAIRING_CODE_LENGTH: usize = 6;

/// Pairing behavior knobs.
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// Pairing code lifetime.
    pub code_ttl: Duration,
    /// Consecutive failures before lockout.
    pub max_attempts: u32,
    /// Lockout duration once the threshold is crossed.
    pub lockout: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            code_ttl: Duration::from_secs(300),
            max_attempts: 5,
            lockout: Duration::from_secs(300),
        }
    }
}

impl From<&PairingSection> for PairingConfig {
    fn from(section: &PairingSection) -> Self {
        Self {
            code_ttl: Duration::from_secs(section.code_ttl_secs),
            max_attempts: section.max_attempts,
            lockout: Duration::from_secs(section.lockout_secs),
        }
    }
}

/// Identity a hub presents while asking to pair.
#[derive(Debug, Clone)]
pub struct HubInfo {
    /// Stable hub id.
    pub id: String,
    /// Hub display name.
    pub name: String,
    /// Hub platform tag.
    pub platform: String,
}

/// Ephemeral pairing challenge. At most one is active at a time.
struct PairingChallenge {
    code: Zeroizing<String>,
    hub: HubInfo,
    expires_at: Instant,
    attempts: u32,
}

/// Rolling failure counter and lockout window.
///
/// Lives outside the challenge so that dropping the connection and
/// reconnecting does not refresh the attempt budget.
#[derive(Default)]
struct PairingLockout {
    consecutive_failures: u32,
    locked_until: Option<Instant>,
}

impl PairingLockout {
    fn remaining(&self, now: Instant) -> Option<Duration> {
        let until = self.locked_until?;
        if now < until { Some(until - now) } else { None }
    }
}

/// Issues pairing codes, validates submissions, and owns the token store.
pub struct PairingManager {
    config: PairingConfig,
    store: RwLock<TokenStore>,
    challenge: Mutex<Option<PairingChallenge>>,
    lockout: Mutex<PairingLockout>,
    events: Arc<EventQueue>,
}

impl PairingManager {
    /// Create a pairing manager over an opened token store.
    pub fn new(config: PairingConfig, store: TokenStore, events: Arc<EventQueue>) -> Self {
        Self {
            config,
            store: RwLock::new(store),
            challenge: Mutex::new(None),
            lockout: Mutex::new(PairingLockout::default()),
            events,
        }
    }

    /// Start pairing for an unauthenticated hub.
    ///
    /// Generates a fresh code, replaces any previous challenge, and pushes
    /// the code to the observer on the `pairing_code` topic. The code is
    /// never sent to the hub.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::PairingLocked`] while the lockout window is
    /// active.
    pub async fn begin_pairing(&self, hub: HubInfo) -> Result<Duration> {
        let now = Instant::now();
        if let Some(remaining) = self.lockout.lock().await.remaining(now) {
            return Err(AgentError::PairingLocked {
                retry_after_secs: remaining.as_secs().max(1),
            });
        }

        let code = generate_code()?;
        self.events
            .publish(Topic::PairingCode, json!({ "code": code.as_str() }));

        tracing::info!(hub_id = %hub.id, hub_name = %hub.name, "pairing challenge issued");

        *self.challenge.lock().await = Some(PairingChallenge {
            code,
            hub,
            expires_at: now + self.config.code_ttl,
            attempts: 0,
        });

        Ok(self.config.code_ttl)
    }

    /// Verify a hub-submitted pairing code.
    ///
    /// Lockout is consulted before the code is compared, so a locked-out
    /// submission reveals nothing about correctness. On success the
    /// challenge is destroyed, the lockout cleared, and a fresh token
    /// persisted and returned.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::PairingLocked`] while locked out, or
    /// [`AgentError::Auth`] for a missing/expired challenge or a wrong
    /// code.
    pub async fn verify_pairing(&self, submitted: &str) -> Result<(HubInfo, HubToken)> {
        let now = Instant::now();

        // Lockout check first: no comparison, no timing signal.
        if let Some(remaining) = self.lockout.lock().await.remaining(now) {
            return Err(AgentError::PairingLocked {
                retry_after_secs: remaining.as_secs().max(1),
            });
        }

        let mut challenge_slot = self.challenge.lock().await;
        let challenge = challenge_slot
            .as_mut()
            .ok_or_else(|| AgentError::auth("no pairing in progress"))?;

        if now >= challenge.expires_at {
            *challenge_slot = None;
            return Err(AgentError::auth("pairing code expired"));
        }

        let matched: bool = challenge
            .code
            .as_bytes()
            .ct_eq(submitted.as_bytes())
            .into();

        if !matched {
            challenge.attempts += 1;
            let exhausted = challenge.attempts >= self.config.max_attempts;
            if exhausted {
                *challenge_slot = None;
            }
            drop(challenge_slot);

            self.record_failure(now).await;
            return Err(AgentError::auth("invalid pairing code"));
        }

        let hub = challenge.hub.clone();
        *challenge_slot = None;
        drop(challenge_slot);

        let token = HubToken::mint()?;
        let record = AuthorizedHub {
            name: hub.name.clone(),
            platform: hub.platform.clone(),
            token: token.clone(),
            paired_at: unix_secs(),
        };
        self.store.write().await.insert(hub.id.clone(), record)?;

        *self.lockout.lock().await = PairingLockout::default();

        self.events.publish(
            Topic::PairingSuccess,
            json!({ "hubId": hub.id, "name": hub.name }),
        );
        tracing::info!(
            hub_id = %hub.id,
            token = %token.fingerprint(),
            "pairing completed, hub authorized"
        );

        Ok((hub, token))
    }

    /// Check a token presented at handshake, constant-time.
    pub async fn verify_token(&self, hub_id: &str, presented: &str) -> bool {
        self.store.read().await.verify(hub_id, presented)
    }

    /// Delete a hub's authorization. Returns true if a record existed.
    ///
    /// The caller (connection engine) must force-disconnect the hub if it
    /// is the one currently connected.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Storage`] if persisting the removal fails.
    pub async fn revoke(&self, hub_id: &str) -> Result<bool> {
        let removed = self.store.write().await.remove(hub_id)?;
        if removed {
            tracing::info!(hub_id, "hub authorization revoked");
        }
        Ok(removed)
    }

    /// All paired hubs, for the external "paired hubs" view.
    pub async fn list_authorized(&self) -> Vec<(String, AuthorizedHub)> {
        self.store.read().await.list()
    }

    /// Drop any in-flight challenge (connection closed). Lockout state is
    /// deliberately retained.
    pub async fn discard_challenge(&self) {
        *self.challenge.lock().await = None;
    }

    /// Seconds remaining on the active lockout, if any.
    pub async fn lockout_remaining(&self) -> Option<Duration> {
        self.lockout.lock().await.remaining(Instant::now())
    }

    /// Periodic maintenance: discard expired challenges and elapsed
    /// lockout windows.
    pub async fn sweep(&self) {
        let now = Instant::now();

        let mut challenge = self.challenge.lock().await;
        if challenge.as_ref().is_some_and(|c| now >= c.expires_at) {
            tracing::debug!("pairing challenge expired");
            *challenge = None;
        }
        drop(challenge);

        let mut lockout = self.lockout.lock().await;
        if lockout.locked_until.is_some_and(|until| now >= until) {
            *lockout = PairingLockout::default();
            tracing::info!("pairing lockout elapsed");
        }
    }

    async fn record_failure(&self, now: Instant) {
        let mut lockout = self.lockout.lock().await;
        lockout.consecutive_failures += 1;
        tracing::warn!(
            failures = lockout.consecutive_failures,
            "pairing attempt failed"
        );

        if lockout.consecutive_failures >= self.config.max_attempts {
            lockout.locked_until = Some(now + self.config.lockout);
            let secs = self.config.lockout.as_secs();
            self.events
                .publish(Topic::PairingLocked, json!({ "remainingSeconds": secs }));
            tracing::warn!(lockout_secs = secs, "pairing locked out");
        }
    }
}

/// Generate a fixed-length numeric code via rejection sampling from the
/// OS CSPRNG. Plain `byte % 10` would bias toward low digits.
fn generate_code() -> Result<Zeroizing<String>> {
    let mut code = String::with_capacity(PAIRING_CODE_LENGTH);
    let mut buf = [0u8; 16];

    while code.len() < PAIRING_CODE_LENGTH {
        getrandom::getrandom(&mut buf)
            .map_err(|_| AgentError::Fatal("OS CSPRNG unavailable".into()))?;
        for byte in buf {
            if byte < 250 {
                code.push(char::from(b'0' + byte % 10));
                if code.len() == PAIRING_CODE_LENGTH {
                    break;
                }
            }
        }
    }

    Ok(Zeroizing::new(code))
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PairingConfig {
        PairingConfig {
            code_ttl: Duration::from_secs(60),
            max_attempts: 5,
            lockout: Duration::from_millis(200),
        }
    }

    struct Fixture {
        manager: PairingManager,
        events: Arc<EventQueue>,
        _dir: tempfile::TempDir,
    }

    fn fixture(config: PairingConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::open(dir.path().join("hubs.json")).unwrap();
        let events = Arc::new(EventQueue::new());
        Fixture {
            manager: PairingManager::new(config, store, Arc::clone(&events)),
            events,
            _dir: dir,
        }
    }

    fn hub() -> HubInfo {
        HubInfo {
            id: "hub-1".into(),
            name: "Desk Hub".into(),
            platform: "windows".into(),
        }
    }

    async fn issued_code(events: &EventQueue) -> String {
        let entry = events.poll(Topic::PairingCode).unwrap();
        entry.payload["code"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_code_shape() {
        for _ in 0..100 {
            let code = generate_code().unwrap();
            assert_eq!(code.len(), PAIRING_CODE_LENGTH);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn test_pairing_happy_path() {
        let fx = fixture(test_config());
        fx.manager.begin_pairing(hub()).await.unwrap();
        let code = issued_code(&fx.events).await;

        let (paired, token) = fx.manager.verify_pairing(&code).await.unwrap();
        assert_eq!(paired.id, "hub-1");
        assert!(fx.manager.verify_token("hub-1", token.expose()).await);
        assert!(fx.events.poll(Topic::PairingSuccess).is_some());
    }

    #[tokio::test]
    async fn test_code_verifies_exactly_once() {
        let fx = fixture(test_config());
        fx.manager.begin_pairing(hub()).await.unwrap();
        let code = issued_code(&fx.events).await;

        fx.manager.verify_pairing(&code).await.unwrap();

        // Challenge destroyed: the same code is now rejected.
        assert!(matches!(
            fx.manager.verify_pairing(&code).await,
            Err(AgentError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_lockout_after_threshold_even_with_correct_code() {
        let fx = fixture(test_config());
        fx.manager.begin_pairing(hub()).await.unwrap();
        let code = issued_code(&fx.events).await;

        for _ in 0..5 {
            let wrong = if code == "000000" { "111111" } else { "000000" };
            assert!(fx.manager.verify_pairing(wrong).await.is_err());
        }
        assert!(fx.events.poll(Topic::PairingLocked).is_some());

        // Sixth attempt with the correct code is still rejected as locked.
        assert!(matches!(
            fx.manager.verify_pairing(&code).await,
            Err(AgentError::PairingLocked { .. })
        ));
    }

    #[tokio::test]
    async fn test_lockout_blocks_new_challenges() {
        let fx = fixture(test_config());
        fx.manager.begin_pairing(hub()).await.unwrap();
        let code = issued_code(&fx.events).await;
        let wrong = if code == "000000" { "111111" } else { "000000" };

        for _ in 0..5 {
            let _ = fx.manager.verify_pairing(wrong).await;
        }

        assert!(matches!(
            fx.manager.begin_pairing(hub()).await,
            Err(AgentError::PairingLocked { .. })
        ));
    }

    #[tokio::test]
    async fn test_lockout_survives_challenge_discard() {
        // Simulates disconnect/reconnect: dropping the challenge must not
        // reset the failure budget.
        let fx = fixture(test_config());
        fx.manager.begin_pairing(hub()).await.unwrap();
        let code = issued_code(&fx.events).await;
        let wrong = if code == "000000" { "111111" } else { "000000" };

        for _ in 0..3 {
            let _ = fx.manager.verify_pairing(wrong).await;
        }
        fx.manager.discard_challenge().await;

        fx.manager.begin_pairing(hub()).await.unwrap();
        let code2 = issued_code(&fx.events).await;
        let wrong2 = if code2 == "000000" { "111111" } else { "000000" };
        for _ in 0..2 {
            let _ = fx.manager.verify_pairing(wrong2).await;
        }

        // 3 + 2 failures across two connections crosses the threshold.
        assert!(fx.manager.lockout_remaining().await.is_some());
    }

    #[tokio::test]
    async fn test_lockout_expires() {
        let fx = fixture(test_config());
        fx.manager.begin_pairing(hub()).await.unwrap();
        let code = issued_code(&fx.events).await;
        let wrong = if code == "000000" { "111111" } else { "000000" };

        for _ in 0..5 {
            let _ = fx.manager.verify_pairing(wrong).await;
        }
        assert!(fx.manager.lockout_remaining().await.is_some());

        tokio::time::sleep(Duration::from_millis(250)).await;
        fx.manager.sweep().await;
        assert!(fx.manager.lockout_remaining().await.is_none());

        // Pairing works again after the window elapses.
        fx.manager.begin_pairing(hub()).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_challenge_rejected() {
        let mut config = test_config();
        config.code_ttl = Duration::from_millis(20);
        let fx = fixture(config);

        fx.manager.begin_pairing(hub()).await.unwrap();
        let code = issued_code(&fx.events).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            fx.manager.verify_pairing(&code).await,
            Err(AgentError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_revoke_removes_authorization() {
        let fx = fixture(test_config());
        fx.manager.begin_pairing(hub()).await.unwrap();
        let code = issued_code(&fx.events).await;
        let (_, token) = fx.manager.verify_pairing(&code).await.unwrap();

        assert!(fx.manager.revoke("hub-1").await.unwrap());
        assert!(!fx.manager.verify_token("hub-1", token.expose()).await);
        assert!(!fx.manager.revoke("hub-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_success_resets_lockout_counter() {
        let fx = fixture(test_config());
        fx.manager.begin_pairing(hub()).await.unwrap();
        let code = issued_code(&fx.events).await;
        let wrong = if code == "000000" { "111111" } else { "000000" };

        for _ in 0..4 {
            let _ = fx.manager.verify_pairing(wrong).await;
        }
        fx.manager.verify_pairing(&code).await.unwrap();

        // Failure budget is fresh after a successful pairing.
        fx.manager.begin_pairing(hub()).await.unwrap();
        let code2 = issued_code(&fx.events).await;
        let wrong2 = if code2 == "000000" { "111111" } else { "000000" };
        for _ in 0..4 {
            let _ = fx.manager.verify_pairing(wrong2).await;
        }
        assert!(fx.manager.lockout_remaining().await.is_none());
    }
}
