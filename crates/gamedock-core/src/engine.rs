//! Per-connection protocol engine.
//!
//! One engine instance exists per accepted connection and walks the
//! phase machine `Connected -> PairingOffered -> Authenticated ->
//! Closed`. The engine is transport-free: the server feeds it decoded
//! envelopes and writes back whatever [`Action`] says, which keeps the
//! whole dispatch surface testable without sockets.

use std::sync::Arc;

use gamedock_proto::{
    ADVERTISED_CHUNK_SIZE, AgentStatus, BeginUpload, ChunkAck, Envelope, ErrorCode, FinishUpload,
    HubConnect, InstalledEntry, InstalledList, MessageKind, OperationResult, PROTOCOL_MIN_SUPPORTED,
    PROTOCOL_VERSION, PairConfirm, PairSuccess, PairingRequired, StatusResponse, UninstallRequest,
    UploadAccepted, UploadChunk, UploadCancel, WireError,
};
use serde::Serialize;
use serde_json::json;

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::events::{EventQueue, Topic};
use crate::identity::AgentIdentity;
use crate::library::Library;
use crate::pairing::{HubInfo, PairingConfig, PairingManager};
use crate::store::TokenStore;
use crate::upload::{UploadConfig, UploadManager};

/// Everything shared across connections and maintenance tasks.
pub struct AgentState {
    /// Device identity.
    pub identity: AgentIdentity,
    /// Loaded configuration.
    pub config: AgentConfig,
    /// Pairing and token authority.
    pub pairing: PairingManager,
    /// Upload slot and staging I/O.
    pub uploads: UploadManager,
    /// Completed-artifact access.
    pub library: Library,
    /// Observer-facing queues.
    pub events: Arc<EventQueue>,
}

impl AgentState {
    /// Assemble the shared state from configuration and an opened token
    /// store.
    pub fn new(config: AgentConfig, identity: AgentIdentity, store: TokenStore) -> Self {
        let events = Arc::new(EventQueue::new());
        let pairing = PairingManager::new(
            PairingConfig::from(&config.pairing),
            store,
            Arc::clone(&events),
        );
        let uploads = UploadManager::new(
            UploadConfig {
                install_root: config.storage.install_root.clone(),
                idle_timeout: std::time::Duration::from_secs(config.storage.session_idle_secs),
            },
            Arc::clone(&events),
        );
        let library = Library::new(config.storage.install_root.clone(), Arc::clone(&events));

        Self {
            identity,
            config,
            pairing,
            uploads,
            library,
            events,
        }
    }
}

/// Connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Transport open, no handshake yet.
    Connected,
    /// Handshake received from an unpaired hub; waiting for the code.
    PairingOffered,
    /// Hub authenticated; full message set available.
    Authenticated,
    /// Connection is done.
    Closed,
}

/// What the server should do after one inbound envelope.
#[derive(Debug)]
pub struct Action {
    /// Envelope to write back, if any.
    pub reply: Option<Envelope>,
    /// Close the connection after writing.
    pub close: bool,
}

impl Action {
    fn reply(envelope: Envelope) -> Self {
        Self {
            reply: Some(envelope),
            close: false,
        }
    }

    fn closing(envelope: Envelope) -> Self {
        Self {
            reply: Some(envelope),
            close: true,
        }
    }
}

/// Protocol engine for a single connection.
pub struct ConnectionEngine {
    state: Arc<AgentState>,
    phase: Phase,
    hub: Option<HubInfo>,
}

impl ConnectionEngine {
    /// Engine for a freshly accepted connection.
    pub fn new(state: Arc<AgentState>) -> Self {
        Self {
            state,
            phase: Phase::Connected,
            hub: None,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The authenticated hub, if the handshake completed.
    #[must_use]
    pub fn hub(&self) -> Option<&HubInfo> {
        self.hub.as_ref()
    }

    /// Handle one inbound envelope.
    ///
    /// Never fails: engine errors become `error` responses correlated to
    /// the request id, and only unrecoverable ones close the connection.
    pub async fn handle(&mut self, envelope: Envelope) -> Action {
        let id = envelope.id.clone();
        let kind = envelope.kind;
        match self.dispatch(envelope).await {
            Ok(action) => action,
            Err(e) => {
                tracing::warn!(?kind, error = %e, "request failed");
                if e.is_observer_visible() {
                    self.state
                        .events
                        .publish(Topic::ServerError, json!({ "message": e.to_string() }));
                }
                Action {
                    reply: Some(Envelope::error(id, e.to_wire())),
                    close: !e.is_recoverable(),
                }
            }
        }
    }

    /// Transport closed. Aborts any receiving upload, discards the
    /// pairing challenge, and tells the observer. Lockout state persists.
    pub async fn on_disconnect(&mut self) {
        if self.phase == Phase::Authenticated {
            self.state.uploads.abort_active("hub disconnected").await;
            let hub_id = self.hub.as_ref().map(|h| h.id.clone());
            self.state
                .events
                .publish(Topic::HubDisconnected, json!({ "hubId": hub_id }));
        }
        self.state.pairing.discard_challenge().await;
        self.phase = Phase::Closed;
    }

    async fn dispatch(&mut self, envelope: Envelope) -> Result<Action> {
        let id = envelope.id.clone();
        match envelope.kind {
            MessageKind::HubConnect => self.on_hub_connect(&envelope).await,
            MessageKind::Ping => Ok(Action::reply(Envelope::bare(id, MessageKind::Pong))),
            MessageKind::PairConfirm => self.on_pair_confirm(&envelope).await,
            MessageKind::GetStatus => {
                self.require_auth()?;
                let payload = StatusResponse {
                    agent_id: self.state.identity.id.clone(),
                    agent_name: self.state.identity.name.clone(),
                    platform: self.state.identity.platform.clone(),
                    version: self.state.identity.version.clone(),
                    install_path: self
                        .state
                        .uploads
                        .install_root()
                        .display()
                        .to_string(),
                    uploading: self.state.uploads.status().await.is_some(),
                };
                respond(id, MessageKind::StatusResponse, &payload)
            }
            MessageKind::BeginUpload => {
                self.require_auth()?;
                let req: BeginUpload = decode(&envelope, "begin_upload")?;
                let session_id = self
                    .state
                    .uploads
                    .begin(&req.name, req.total_size, req.destination.as_deref())
                    .await?;
                respond(
                    id,
                    MessageKind::UploadAccepted,
                    &UploadAccepted {
                        session_id,
                        chunk_size: ADVERTISED_CHUNK_SIZE,
                    },
                )
            }
            MessageKind::UploadChunk => {
                self.require_auth()?;
                let req: UploadChunk = decode(&envelope, "upload_chunk")?;
                let data = req
                    .decode_data()
                    .map_err(|e| AgentError::Protocol(e.to_string().into()))?;
                let ack = self
                    .state
                    .uploads
                    .put_chunk(&req.session_id, &req.file_path, req.offset, &data)
                    .await?;
                respond(
                    id,
                    MessageKind::ChunkAck,
                    &ChunkAck {
                        session_id: req.session_id,
                        bytes_written: ack.bytes_written,
                        total_received: ack.total_received,
                    },
                )
            }
            MessageKind::FinishUpload => {
                self.require_auth()?;
                let req: FinishUpload = decode(&envelope, "finish_upload")?;
                let path = self
                    .state
                    .uploads
                    .finish(&req.session_id, req.checksum.as_deref())
                    .await?;
                respond(
                    id,
                    MessageKind::OperationResult,
                    &OperationResult {
                        success: true,
                        path: Some(path.display().to_string()),
                        message: None,
                    },
                )
            }
            MessageKind::CancelUpload => {
                self.require_auth()?;
                let req: UploadCancel = decode(&envelope, "cancel_upload")?;
                self.state.uploads.cancel(&req.session_id).await?;
                respond(
                    id,
                    MessageKind::OperationResult,
                    &OperationResult {
                        success: true,
                        path: None,
                        message: Some("cancelled".into()),
                    },
                )
            }
            MessageKind::ListInstalled => {
                self.require_auth()?;
                let games = self
                    .state
                    .library
                    .list_installed()
                    .await?
                    .into_iter()
                    .map(|g| InstalledEntry {
                        name: g.name,
                        path: g.path.display().to_string(),
                        size: g.size,
                    })
                    .collect();
                respond(id, MessageKind::InstalledList, &InstalledList { games })
            }
            MessageKind::Uninstall => {
                self.require_auth()?;
                let req: UninstallRequest = decode(&envelope, "uninstall")?;
                self.state.library.uninstall(&req.name).await?;
                respond(
                    id,
                    MessageKind::OperationResult,
                    &OperationResult {
                        success: true,
                        path: None,
                        message: Some(format!("removed {}", req.name)),
                    },
                )
            }
            MessageKind::Unknown => Err(AgentError::protocol("unknown message type")),
            // Agent-originated kinds are never valid inbound.
            _ => Err(AgentError::protocol("unexpected message type")),
        }
    }

    async fn on_hub_connect(&mut self, envelope: &Envelope) -> Result<Action> {
        if self.phase == Phase::Authenticated {
            return Err(AgentError::protocol("handshake already completed"));
        }
        let id = envelope.id.clone();
        let req: HubConnect = decode(envelope, "hub_connect")?;

        if !self.state.config.agent.accept_connections {
            tracing::info!(hub_id = %req.hub_id, "rejecting hub, connections disabled");
            return Ok(Action::closing(Envelope::error(
                id,
                WireError::new(ErrorCode::Locked, "agent is not accepting connections"),
            )));
        }

        // Hubs predating version negotiation never sent the field.
        let requested = if req.protocol_version == 0 {
            1
        } else {
            req.protocol_version
        };
        if !(PROTOCOL_MIN_SUPPORTED..=PROTOCOL_VERSION).contains(&requested) {
            let err = AgentError::VersionIncompatible {
                requested,
                min: PROTOCOL_MIN_SUPPORTED,
                max: PROTOCOL_VERSION,
            };
            tracing::warn!(hub_id = %req.hub_id, requested, "incompatible protocol version");
            return Ok(Action::closing(Envelope::error(id, err.to_wire())));
        }

        let hub = HubInfo {
            id: req.hub_id.clone(),
            name: req.name.clone(),
            platform: req.platform.clone(),
        };

        if let Some(token) = &req.token {
            if self.state.pairing.verify_token(&req.hub_id, token).await {
                return self.authenticate(id, hub);
            }
            tracing::info!(hub_id = %req.hub_id, "presented token rejected, re-pairing");
        }

        match self.state.pairing.begin_pairing(hub.clone()).await {
            Ok(ttl) => {
                self.phase = Phase::PairingOffered;
                self.hub = Some(hub);
                respond(
                    id,
                    MessageKind::PairingRequired,
                    &PairingRequired {
                        expires_in: ttl.as_secs(),
                    },
                )
            }
            Err(e @ AgentError::PairingLocked { .. }) => {
                Ok(Action::closing(Envelope::error(id, e.to_wire())))
            }
            Err(e) => Err(e),
        }
    }

    async fn on_pair_confirm(&mut self, envelope: &Envelope) -> Result<Action> {
        if self.phase != Phase::PairingOffered {
            return Err(AgentError::auth("no pairing in progress"));
        }
        let id = envelope.id.clone();
        let req: PairConfirm = decode(envelope, "pair_confirm")?;

        match self.state.pairing.verify_pairing(&req.code).await {
            Ok((hub, token)) => {
                // The token is sent exactly once; authentication follows
                // immediately on this connection.
                let action = respond(
                    id,
                    MessageKind::PairSuccess,
                    &PairSuccess {
                        token: token.expose().to_string(),
                    },
                )?;
                self.announce_connected(&hub);
                self.phase = Phase::Authenticated;
                self.hub = Some(hub);
                Ok(action)
            }
            Err(e @ (AgentError::Auth(_) | AgentError::PairingLocked { .. })) => {
                // Wrong code or lockout answers pair_failed; the hub may
                // retry on the same connection until locked out.
                let mut failed = Envelope::error(id, e.to_wire());
                failed.kind = MessageKind::PairFailed;
                Ok(Action::reply(failed))
            }
            Err(e) => Err(e),
        }
    }

    fn authenticate(&mut self, id: String, hub: HubInfo) -> Result<Action> {
        tracing::info!(hub_id = %hub.id, hub_name = %hub.name, "hub authenticated");
        self.announce_connected(&hub);
        self.phase = Phase::Authenticated;
        self.hub = Some(hub);

        respond(
            id,
            MessageKind::AgentStatus,
            &AgentStatus {
                name: self.state.identity.name.clone(),
                version: self.state.identity.version.clone(),
                platform: self.state.identity.platform.clone(),
                accept_connections: self.state.config.agent.accept_connections,
                protocol_version: PROTOCOL_VERSION,
                telemetry_enabled: self.state.config.telemetry.enabled,
                telemetry_interval: self.state.config.telemetry.interval_secs,
                console_log_enabled: self.state.config.telemetry.console_log_enabled,
            },
        )
    }

    fn announce_connected(&self, hub: &HubInfo) {
        self.state.events.publish(
            Topic::HubConnected,
            json!({ "hubId": hub.id, "name": hub.name, "platform": hub.platform }),
        );
    }

    fn require_auth(&self) -> Result<()> {
        if self.phase == Phase::Authenticated {
            Ok(())
        } else {
            Err(AgentError::auth("authentication required"))
        }
    }
}

fn respond<T: Serialize>(id: String, kind: MessageKind, payload: &T) -> Result<Action> {
    Envelope::response(id, kind, payload)
        .map(Action::reply)
        .map_err(|e| AgentError::Protocol(e.to_string().into()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(
    envelope: &Envelope,
    kind_name: &'static str,
) -> Result<T> {
    envelope
        .decode_payload(kind_name)
        .map_err(|e| AgentError::Protocol(e.to_string().into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        state: Arc<AgentState>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn fixture_with(tweak: impl FnOnce(&mut AgentConfig)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.storage.install_root = dir.path().join("Games");
        tweak(&mut config);

        let identity = AgentIdentity {
            id: "agent-1".into(),
            name: "Test Device".into(),
            platform: "linux".into(),
            version: "0.3.1".into(),
        };
        let store = TokenStore::open(dir.path().join("hubs.json")).unwrap();
        Fixture {
            state: Arc::new(AgentState::new(config, identity, store)),
            _dir: dir,
        }
    }

    fn connect_envelope(token: Option<&str>, protocol_version: u32) -> Envelope {
        Envelope::response(
            "c-1",
            MessageKind::HubConnect,
            &HubConnect {
                hub_id: "hub-1".into(),
                name: "Desk Hub".into(),
                platform: "windows".into(),
                version: "1.0.0".into(),
                protocol_version,
                token: token.map(str::to_string),
            },
        )
        .unwrap()
    }

    async fn pair(fx: &Fixture, engine: &mut ConnectionEngine) -> String {
        let action = engine.handle(connect_envelope(None, 1)).await;
        assert_eq!(
            action.reply.as_ref().unwrap().kind,
            MessageKind::PairingRequired
        );

        let code = fx
            .state
            .events
            .poll(Topic::PairingCode)
            .unwrap()
            .payload["code"]
            .as_str()
            .unwrap()
            .to_string();

        let confirm = Envelope::response(
            "c-2",
            MessageKind::PairConfirm,
            &PairConfirm { code },
        )
        .unwrap();
        let action = engine.handle(confirm).await;
        let reply = action.reply.unwrap();
        assert_eq!(reply.kind, MessageKind::PairSuccess);
        let payload: PairSuccess = reply.decode_payload("pair_success").unwrap();
        payload.token
    }

    #[tokio::test]
    async fn test_unpaired_handshake_offers_pairing() {
        let fx = fixture();
        let mut engine = ConnectionEngine::new(Arc::clone(&fx.state));

        let action = engine.handle(connect_envelope(None, 1)).await;
        let reply = action.reply.unwrap();
        assert_eq!(reply.kind, MessageKind::PairingRequired);
        assert_eq!(engine.phase(), Phase::PairingOffered);

        // The code never rides in the hub-facing payload.
        let payload: PairingRequired = reply.decode_payload("pairing_required").unwrap();
        assert_eq!(payload.expires_in, 300);
    }

    #[tokio::test]
    async fn test_pair_then_reconnect_with_token() {
        let fx = fixture();

        let mut engine = ConnectionEngine::new(Arc::clone(&fx.state));
        let token = pair(&fx, &mut engine).await;
        assert_eq!(engine.phase(), Phase::Authenticated);
        engine.on_disconnect().await;

        // New connection with the minted token skips pairing.
        let mut engine = ConnectionEngine::new(Arc::clone(&fx.state));
        let action = engine.handle(connect_envelope(Some(&token), 1)).await;
        assert_eq!(action.reply.unwrap().kind, MessageKind::AgentStatus);
        assert_eq!(engine.phase(), Phase::Authenticated);
    }

    #[tokio::test]
    async fn test_status_reports_streaming_settings() {
        let fx = fixture_with(|c| {
            c.telemetry.enabled = true;
            c.telemetry.interval_secs = 5;
        });

        let mut engine = ConnectionEngine::new(Arc::clone(&fx.state));
        let token = pair(&fx, &mut engine).await;
        engine.on_disconnect().await;

        let mut engine = ConnectionEngine::new(Arc::clone(&fx.state));
        let action = engine.handle(connect_envelope(Some(&token), 1)).await;
        let reply = action.reply.unwrap();
        assert_eq!(reply.kind, MessageKind::AgentStatus);

        let status: AgentStatus = reply.decode_payload("agent_status").unwrap();
        assert!(status.telemetry_enabled);
        assert_eq!(status.telemetry_interval, 5);
        assert!(!status.console_log_enabled);
    }

    #[tokio::test]
    async fn test_bad_token_falls_back_to_pairing() {
        let fx = fixture();
        let mut engine = ConnectionEngine::new(Arc::clone(&fx.state));

        let action = engine.handle(connect_envelope(Some("stale-token"), 1)).await;
        assert_eq!(action.reply.unwrap().kind, MessageKind::PairingRequired);
        assert_eq!(engine.phase(), Phase::PairingOffered);
    }

    #[tokio::test]
    async fn test_incompatible_version_rejected_and_closed() {
        let fx = fixture();
        let mut engine = ConnectionEngine::new(Arc::clone(&fx.state));

        let action = engine.handle(connect_envelope(None, 99)).await;
        assert!(action.close);
        assert_eq!(action.reply.unwrap().error.unwrap().code, 406);
    }

    #[tokio::test]
    async fn test_version_zero_treated_as_one() {
        let fx = fixture();
        let mut engine = ConnectionEngine::new(Arc::clone(&fx.state));

        let action = engine.handle(connect_envelope(None, 0)).await;
        assert_eq!(action.reply.unwrap().kind, MessageKind::PairingRequired);
    }

    #[tokio::test]
    async fn test_requests_before_auth_rejected() {
        let fx = fixture();
        let mut engine = ConnectionEngine::new(Arc::clone(&fx.state));

        let req = Envelope::response(
            "u-1",
            MessageKind::BeginUpload,
            &BeginUpload {
                name: "Game".into(),
                total_size: 100,
                destination: None,
            },
        )
        .unwrap();
        let action = engine.handle(req).await;
        assert!(!action.close);
        assert_eq!(action.reply.unwrap().error.unwrap().code, 401);
    }

    #[tokio::test]
    async fn test_wrong_code_answers_pair_failed() {
        let fx = fixture();
        let mut engine = ConnectionEngine::new(Arc::clone(&fx.state));
        engine.handle(connect_envelope(None, 1)).await;

        let code = fx.state.events.poll(Topic::PairingCode).unwrap().payload["code"]
            .as_str()
            .unwrap()
            .to_string();
        let wrong = if code == "000000" { "111111" } else { "000000" };

        let confirm = Envelope::response(
            "p-1",
            MessageKind::PairConfirm,
            &PairConfirm { code: wrong.into() },
        )
        .unwrap();
        let action = engine.handle(confirm).await;
        assert!(!action.close);
        let reply = action.reply.unwrap();
        assert_eq!(reply.kind, MessageKind::PairFailed);
        assert_eq!(reply.error.unwrap().code, 401);
    }

    #[tokio::test]
    async fn test_unknown_kind_keeps_connection_open() {
        let fx = fixture();
        let mut engine = ConnectionEngine::new(Arc::clone(&fx.state));

        let raw = r#"{"id":"x-1","type":"launch_missiles"}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        let action = engine.handle(envelope).await;
        assert!(!action.close);
        assert_eq!(action.reply.unwrap().error.unwrap().code, 400);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let fx = fixture();
        let mut engine = ConnectionEngine::new(Arc::clone(&fx.state));

        let action = engine.handle(Envelope::bare("k-1", MessageKind::Ping)).await;
        let reply = action.reply.unwrap();
        assert_eq!(reply.kind, MessageKind::Pong);
        assert_eq!(reply.id, "k-1");
    }

    #[tokio::test]
    async fn test_connections_disabled_rejects_handshake() {
        let fx = fixture_with(|c| c.agent.accept_connections = false);
        let mut engine = ConnectionEngine::new(Arc::clone(&fx.state));

        let action = engine.handle(connect_envelope(None, 1)).await;
        assert!(action.close);
        assert_eq!(action.reply.unwrap().error.unwrap().code, 423);
    }

    #[tokio::test]
    async fn test_upload_flow_over_envelopes() {
        let fx = fixture();
        let mut engine = ConnectionEngine::new(Arc::clone(&fx.state));
        pair(&fx, &mut engine).await;

        let begin = Envelope::response(
            "u-1",
            MessageKind::BeginUpload,
            &BeginUpload {
                name: "Hollow Depths".into(),
                total_size: 1000,
                destination: None,
            },
        )
        .unwrap();
        let reply = engine.handle(begin).await.reply.unwrap();
        assert_eq!(reply.kind, MessageKind::UploadAccepted);
        let accepted: UploadAccepted = reply.decode_payload("upload_accepted").unwrap();

        for (offset, len) in [(0u64, 600usize), (600, 400)] {
            let chunk = Envelope::response(
                "u-2",
                MessageKind::UploadChunk,
                &UploadChunk::from_bytes(
                    accepted.session_id.clone(),
                    "game.bin",
                    offset,
                    &vec![7u8; len],
                ),
            )
            .unwrap();
            let reply = engine.handle(chunk).await.reply.unwrap();
            assert_eq!(reply.kind, MessageKind::ChunkAck);
        }

        let finish = Envelope::response(
            "u-3",
            MessageKind::FinishUpload,
            &FinishUpload {
                session_id: accepted.session_id,
                checksum: None,
            },
        )
        .unwrap();
        let reply = engine.handle(finish).await.reply.unwrap();
        assert_eq!(reply.kind, MessageKind::OperationResult);
        let result: OperationResult = reply.decode_payload("operation_result").unwrap();
        assert!(result.success);
        assert!(result.path.unwrap().ends_with("Hollow Depths"));
    }

    #[tokio::test]
    async fn test_disconnect_aborts_receiving_session() {
        let fx = fixture();
        let mut engine = ConnectionEngine::new(Arc::clone(&fx.state));
        pair(&fx, &mut engine).await;

        let begin = Envelope::response(
            "u-1",
            MessageKind::BeginUpload,
            &BeginUpload {
                name: "Game".into(),
                total_size: 1000,
                destination: None,
            },
        )
        .unwrap();
        let reply = engine.handle(begin).await.reply.unwrap();
        let accepted: UploadAccepted = reply.decode_payload("upload_accepted").unwrap();

        let chunk = Envelope::response(
            "u-2",
            MessageKind::UploadChunk,
            &UploadChunk::from_bytes(accepted.session_id, "game.bin", 0, &[0u8; 800]),
        )
        .unwrap();
        engine.handle(chunk).await;

        engine.on_disconnect().await;
        assert_eq!(engine.phase(), Phase::Closed);
        assert!(fx.state.uploads.status().await.is_none());
        assert!(!fx.state.config.storage.install_root.join("Game").exists());
    }
}
