//! TCP listener and connection servicing.
//!
//! Exactly one connection is serviced at a time. A newer accept wins:
//! the previous connection is signalled to close before the new one is
//! handed to an engine, so a hub that lost its socket can reconnect
//! immediately instead of waiting out a dead peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gamedock_proto::{Envelope, ErrorCode, ProtoError, WireError, read_envelope, write_envelope};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};

use crate::engine::{AgentState, ConnectionEngine, Phase};
use crate::error::{AgentError, Result};
use crate::identity::Advertisement;

/// Maintenance sweep cadence: challenge expiry, lockout expiry, idle
/// session reaping.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Default)]
struct ActiveSlot {
    hub_id: Option<String>,
    shutdown: Option<Arc<Notify>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

/// The agent's TCP server.
pub struct AgentServer {
    state: Arc<AgentState>,
    listener: TcpListener,
    local_addr: SocketAddr,
    active: Arc<Mutex<ActiveSlot>>,
}

/// Cloneable handle for out-of-band control (observer/CLI side).
#[derive(Clone)]
pub struct AgentHandle {
    state: Arc<AgentState>,
    active: Arc<Mutex<ActiveSlot>>,
    local_addr: SocketAddr,
}

impl AgentServer {
    /// Bind the configured listen address.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Fatal`] if the address cannot be bound;
    /// there is nothing to retry without operator intervention.
    pub async fn bind(state: Arc<AgentState>) -> Result<Self> {
        let addr = state.config.parse_listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AgentError::Fatal(format!("cannot bind {addr}: {e}").into()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| AgentError::Fatal(format!("listener address unavailable: {e}").into()))?;

        tracing::info!(%local_addr, "listening for hub connections");
        Ok(Self {
            state,
            listener,
            local_addr,
            active: Arc::new(Mutex::new(ActiveSlot::default())),
        })
    }

    /// The bound address, for the discovery boundary.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Control handle usable while the server runs.
    #[must_use]
    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            state: Arc::clone(&self.state),
            active: Arc::clone(&self.active),
            local_addr: self.local_addr,
        }
    }

    /// Accept and service connections until the task is cancelled.
    pub async fn run(self) {
        let sweep_state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                interval.tick().await;
                sweep_state.pairing.sweep().await;
                sweep_state.uploads.reap_idle().await;
            }
        });

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::info!(%peer, "connection accepted");
                    let shutdown = Arc::new(Notify::new());
                    let (prev_shutdown, prev_task) = {
                        let mut slot = self.active.lock().await;
                        let prev_shutdown = slot.shutdown.replace(Arc::clone(&shutdown));
                        let prev_task = slot.task.take();
                        slot.hub_id = None;
                        (prev_shutdown, prev_task)
                    };
                    if let Some(previous) = prev_shutdown {
                        tracing::info!("closing previous connection, newer hub wins");
                        previous.notify_one();
                    }
                    // The displaced connection's disconnect handling aborts
                    // its session and challenge. That must complete before
                    // the new connection is serviced, or it would tear down
                    // state the new hub just set up.
                    if let Some(task) = prev_task {
                        let _ = task.await;
                    }

                    let state = Arc::clone(&self.state);
                    let active = Arc::clone(&self.active);
                    let task = tokio::spawn(async move {
                        serve_connection(stream, state, shutdown, active).await;
                    });
                    self.active.lock().await.task = Some(task);
                }
                Err(e) => {
                    tracing::warn!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

impl AgentHandle {
    /// Shared agent state.
    #[must_use]
    pub fn state(&self) -> &Arc<AgentState> {
        &self.state
    }

    /// What the discovery layer should advertise.
    #[must_use]
    pub fn advertisement(&self) -> Advertisement {
        self.state.identity.advertisement(self.local_addr.port())
    }

    /// Revoke a hub's authorization, force-disconnecting it if it is the
    /// one currently connected.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Storage`] if persisting the removal fails.
    pub async fn revoke_hub(&self, hub_id: &str) -> Result<bool> {
        let removed = self.state.pairing.revoke(hub_id).await?;
        if removed {
            let slot = self.active.lock().await;
            if slot.hub_id.as_deref() == Some(hub_id) {
                if let Some(shutdown) = &slot.shutdown {
                    tracing::info!(hub_id, "disconnecting revoked hub");
                    shutdown.notify_one();
                }
            }
        }
        Ok(removed)
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    state: Arc<AgentState>,
    shutdown: Arc<Notify>,
    active: Arc<Mutex<ActiveSlot>>,
) {
    let mut engine = ConnectionEngine::new(state);

    // Register for the shutdown signal once, before the first read. A
    // fresh `notified()` per loop iteration would miss a signal sent
    // while a message was being handled.
    let shutdown_fut = shutdown.notified();
    tokio::pin!(shutdown_fut);

    loop {
        tokio::select! {
            _ = &mut shutdown_fut => break,
            result = read_envelope(&mut stream) => match result {
                Ok(envelope) => {
                    let action = engine.handle(envelope).await;

                    if engine.phase() == Phase::Authenticated {
                        let mut slot = active.lock().await;
                        if slot.hub_id.is_none() {
                            slot.hub_id = engine.hub().map(|h| h.id.clone());
                        }
                    }

                    if let Some(reply) = action.reply {
                        if let Err(e) = write_envelope(&mut stream, &reply).await {
                            tracing::debug!("write failed: {e}");
                            break;
                        }
                    }
                    if action.close {
                        break;
                    }
                }
                Err(ProtoError::ConnectionClosed) => break,
                Err(e @ ProtoError::Malformed(_)) => {
                    // Frame boundary is intact, the stream can continue.
                    let reply = Envelope::error(
                        String::new(),
                        WireError::new(ErrorCode::BadRequest, e.to_string()),
                    );
                    if write_envelope(&mut stream, &reply).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // Oversized frame or transport failure: cannot resync.
                    tracing::debug!("read failed: {e}");
                    break;
                }
            },
        }
    }

    engine.on_disconnect().await;

    let mut slot = active.lock().await;
    let ours = slot
        .shutdown
        .as_ref()
        .is_some_and(|current| Arc::ptr_eq(current, &shutdown));
    if ours {
        *slot = ActiveSlot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::identity::AgentIdentity;
    use crate::store::TokenStore;
    use gamedock_proto::{HubConnect, MessageKind};

    struct Fixture {
        handle: AgentHandle,
        addr: SocketAddr,
        _dir: tempfile::TempDir,
    }

    async fn start_server() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.network.listen_addr = "127.0.0.1:0".into();
        config.storage.install_root = dir.path().join("Games");

        let identity = AgentIdentity {
            id: "agent-1".into(),
            name: "Test Device".into(),
            platform: "linux".into(),
            version: "0.3.1".into(),
        };
        let store = TokenStore::open(dir.path().join("hubs.json")).unwrap();
        let state = Arc::new(AgentState::new(config, identity, store));

        let server = AgentServer::bind(state).await.unwrap();
        let addr = server.local_addr();
        let handle = server.handle();
        tokio::spawn(server.run());

        Fixture {
            handle,
            addr,
            _dir: dir,
        }
    }

    async fn connect(addr: SocketAddr) -> TcpStream {
        TcpStream::connect(addr).await.unwrap()
    }

    fn handshake(token: Option<&str>) -> Envelope {
        Envelope::response(
            "h-1",
            MessageKind::HubConnect,
            &HubConnect {
                hub_id: "hub-1".into(),
                name: "Desk Hub".into(),
                platform: "windows".into(),
                version: "1.0.0".into(),
                protocol_version: 1,
                token: token.map(str::to_string),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_handshake_over_socket() {
        let fx = start_server().await;
        let mut stream = connect(fx.addr).await;

        write_envelope(&mut stream, &handshake(None)).await.unwrap();
        let reply = read_envelope(&mut stream).await.unwrap();
        assert_eq!(reply.kind, MessageKind::PairingRequired);
    }

    #[tokio::test]
    async fn test_ping_over_socket() {
        let fx = start_server().await;
        let mut stream = connect(fx.addr).await;

        write_envelope(&mut stream, &Envelope::bare("p-1", MessageKind::Ping))
            .await
            .unwrap();
        let reply = read_envelope(&mut stream).await.unwrap();
        assert_eq!(reply.kind, MessageKind::Pong);
        assert_eq!(reply.id, "p-1");
    }

    #[tokio::test]
    async fn test_newer_connection_wins() {
        let fx = start_server().await;

        let mut first = connect(fx.addr).await;
        write_envelope(&mut first, &handshake(None)).await.unwrap();
        read_envelope(&mut first).await.unwrap();

        // Second connection displaces the first.
        let mut second = connect(fx.addr).await;
        write_envelope(&mut second, &handshake(None)).await.unwrap();
        assert_eq!(
            read_envelope(&mut second).await.unwrap().kind,
            MessageKind::PairingRequired
        );

        // The first connection is now closed.
        let result = read_envelope(&mut first).await;
        assert!(matches!(
            result,
            Err(ProtoError::ConnectionClosed | ProtoError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_json_keeps_connection() {
        use tokio::io::AsyncWriteExt;

        let fx = start_server().await;
        let mut stream = connect(fx.addr).await;

        let body = b"{definitely not json";
        stream
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(body).await.unwrap();

        let reply = read_envelope(&mut stream).await.unwrap();
        assert_eq!(reply.error.unwrap().code, 400);

        // Still serviceable.
        write_envelope(&mut stream, &Envelope::bare("p-1", MessageKind::Ping))
            .await
            .unwrap();
        assert_eq!(
            read_envelope(&mut stream).await.unwrap().kind,
            MessageKind::Pong
        );
    }

    #[tokio::test]
    async fn test_advertisement_reports_bound_port() {
        let fx = start_server().await;
        let ad = fx.handle.advertisement();
        assert_eq!(ad.port, fx.addr.port());
        assert_eq!(ad.id, "agent-1");
    }
}
