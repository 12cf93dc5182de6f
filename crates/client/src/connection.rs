//! Connection orchestrator: three-stage fallback with per-stage timeouts.
//!
//! Stage 1 dials the session host directly over TCP (3 s). Stage 2 goes
//! through the discovery service and WebRTC with STUN-derived candidates
//! (8 s). Stage 3 repeats the WebRTC path restricted to TURN relays
//! (15 s). CLI flags reorder or remove stages; a stage failure or timeout
//! releases that stage's transports and advances to the next one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use glyphchat_protocol::config::ClientConfig;
use glyphchat_protocol::error::NetworkError;
use glyphchat_protocol::packet::Packet;

use crate::discovery::{DiscoveryClient, DiscoveryError};
use crate::peer::{PeerIceConfig, PeerManager};
use crate::shutdown::ShutdownToken;
use crate::transport::PacketTransport;
use crate::transport::tcp::TcpTransport;
use crate::transport::ws::WsTransport;

/// The 13-state connection machine. Discriminants are stable for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,

    AttemptingDirectTcp = 1,
    DirectTcpConnected = 2,
    DirectTcpFailed = 3,

    AttemptingWebrtcStun = 4,
    WebrtcStunSignaling = 5,
    WebrtcStunConnected = 6,
    WebrtcStunFailed = 7,

    AttemptingWebrtcTurn = 8,
    WebrtcTurnSignaling = 9,
    WebrtcTurnConnected = 10,
    WebrtcTurnFailed = 11,

    Connected = 20,
    Disconnected = 21,
    Failed = 22,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    DirectTcp,
    WebrtcStun,
    WebrtcTurn,
}

impl Stage {
    fn attempting(self) -> ConnectionState {
        match self {
            Stage::DirectTcp => ConnectionState::AttemptingDirectTcp,
            Stage::WebrtcStun => ConnectionState::AttemptingWebrtcStun,
            Stage::WebrtcTurn => ConnectionState::AttemptingWebrtcTurn,
        }
    }

    fn connected(self) -> ConnectionState {
        match self {
            Stage::DirectTcp => ConnectionState::DirectTcpConnected,
            Stage::WebrtcStun => ConnectionState::WebrtcStunConnected,
            Stage::WebrtcTurn => ConnectionState::WebrtcTurnConnected,
        }
    }

    fn failed(self) -> ConnectionState {
        match self {
            Stage::DirectTcp => ConnectionState::DirectTcpFailed,
            Stage::WebrtcStun => ConnectionState::WebrtcStunFailed,
            Stage::WebrtcTurn => ConnectionState::WebrtcTurnFailed,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::DirectTcp => "direct-tcp",
            Stage::WebrtcStun => "webrtc-stun",
            Stage::WebrtcTurn => "webrtc-turn",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    pub direct_tcp: Duration,
    pub webrtc_stun: Duration,
    pub webrtc_turn: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            direct_tcp: Duration::from_secs(3),
            webrtc_stun: Duration::from_secs(8),
            webrtc_turn: Duration::from_secs(15),
        }
    }
}

impl StageTimeouts {
    fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::DirectTcp => self.direct_tcp,
            Stage::WebrtcStun => self.webrtc_stun,
            Stage::WebrtcTurn => self.webrtc_turn,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OrchestratorFlags {
    pub prefer_webrtc: bool,
    pub no_webrtc: bool,
    pub skip_stun: bool,
    pub disable_turn: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("all {attempted} connection stages failed")]
    AllStagesFailed { attempted: u32 },
    #[error("connection attempt cancelled")]
    Cancelled,
    #[error("no connection stages enabled by flags")]
    NoStages,
}

/// Shared current/previous state cell; the stage driver reports the
/// signalling transition through it.
#[derive(Clone)]
pub struct StateHandle {
    cell: Arc<Mutex<(ConnectionState, ConnectionState)>>,
}

impl StateHandle {
    fn new() -> Self {
        Self {
            cell: Arc::new(Mutex::new((ConnectionState::Idle, ConnectionState::Idle))),
        }
    }

    pub fn set(&self, next: ConnectionState) {
        let mut cell = self.cell.lock();
        cell.1 = cell.0;
        cell.0 = next;
        info!(state = ?next, previous = ?cell.1, "connection state");
    }

    pub fn current(&self) -> ConnectionState {
        self.cell.lock().0
    }

    pub fn previous(&self) -> ConnectionState {
        self.cell.lock().1
    }
}

/// One connection stage attempt. Implementations must release anything
/// they allocated before returning an error; the orchestrator does not
/// reach into half-built stages.
#[async_trait]
pub trait StageDriver: Send + Sync {
    async fn attempt(
        &self,
        stage: Stage,
        state: &StateHandle,
    ) -> Result<Arc<dyn PacketTransport>, NetworkError>;
}

pub struct Orchestrator {
    pub timeouts: StageTimeouts,
    pub flags: OrchestratorFlags,
    pub state: StateHandle,
    pub stage_failures: u32,
}

impl Orchestrator {
    pub fn new(flags: OrchestratorFlags, timeouts: StageTimeouts) -> Self {
        Self {
            timeouts,
            flags,
            state: StateHandle::new(),
            stage_failures: 0,
        }
    }

    /// Stage order dictated by the flags.
    pub fn stage_order(&self) -> Vec<Stage> {
        if self.flags.no_webrtc {
            return vec![Stage::DirectTcp];
        }
        let mut webrtc_stages = Vec::new();
        if !self.flags.skip_stun {
            webrtc_stages.push(Stage::WebrtcStun);
        }
        if !self.flags.disable_turn {
            webrtc_stages.push(Stage::WebrtcTurn);
        }
        let mut order = Vec::new();
        if self.flags.prefer_webrtc {
            order.extend(webrtc_stages);
            order.push(Stage::DirectTcp);
        } else {
            order.push(Stage::DirectTcp);
            order.extend(webrtc_stages);
        }
        order
    }

    /// Walk the stages until one yields a transport.
    pub async fn establish(
        &mut self,
        driver: &dyn StageDriver,
        shutdown: &ShutdownToken,
    ) -> Result<Arc<dyn PacketTransport>, ConnectError> {
        let order = self.stage_order();
        if order.is_empty() {
            return Err(ConnectError::NoStages);
        }

        for stage in order {
            if shutdown.is_triggered() {
                self.state.set(ConnectionState::Disconnected);
                return Err(ConnectError::Cancelled);
            }
            let timeout = self.timeouts.for_stage(stage);
            self.state.set(stage.attempting());
            let started = Instant::now();

            let result = tokio::select! {
                result = tokio::time::timeout(timeout, driver.attempt(stage, &self.state)) => result,
                _ = shutdown.wait() => {
                    // Aborted by shutdown: leave without advancing stages.
                    self.state.set(ConnectionState::Disconnected);
                    return Err(ConnectError::Cancelled);
                }
            };

            match result {
                Ok(Ok(transport)) => {
                    self.state.set(stage.connected());
                    self.state.set(ConnectionState::Connected);
                    info!(
                        stage = stage.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        transport = transport.label(),
                        "connected"
                    );
                    return Ok(transport);
                }
                Ok(Err(e)) => {
                    warn!(
                        stage = stage.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "stage failed: {e}"
                    );
                }
                Err(_) => {
                    warn!(
                        stage = stage.name(),
                        timeout_ms = timeout.as_millis() as u64,
                        "stage timed out"
                    );
                }
            }
            self.state.set(stage.failed());
            self.stage_failures += 1;
        }

        self.state.set(ConnectionState::Failed);
        Err(ConnectError::AllStagesFailed {
            attempted: self.stage_failures,
        })
    }
}

/// Production stage driver: direct TCP, or discovery + WebRTC.
pub struct NetworkStageDriver {
    pub config: ClientConfig,
    /// Session join results surface here for the caller (participant ids,
    /// TURN credentials).
    pub joined: Mutex<Option<crate::discovery::JoinedSession>>,
    /// The peer connection must outlive its data channel; it parks here
    /// for the rest of the connection's lifetime.
    peer: Mutex<Option<PeerManager>>,
}

impl NetworkStageDriver {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            joined: Mutex::new(None),
            peer: Mutex::new(None),
        }
    }

    /// Session identity from the discovery join, when stage 2/3 won.
    pub fn joined_session(&self) -> Option<crate::discovery::JoinedSession> {
        self.joined.lock().clone()
    }

    /// Direct stage: plain TCP, or a WebSocket when the configured
    /// address is a ws:// / wss:// URL (proxied deployments).
    async fn attempt_direct_tcp(&self) -> Result<Arc<dyn PacketTransport>, NetworkError> {
        let conn = &self.config.connection;
        if conn.address.starts_with("ws://") || conn.address.starts_with("wss://") {
            let transport =
                WsTransport::connect(&conn.address, Duration::from_secs(3)).await?;
            return Ok(Arc::new(transport));
        }
        let transport = TcpTransport::connect(
            &conn.address,
            conn.port,
            Duration::from_secs(3),
        )
        .await?;
        Ok(Arc::new(transport))
    }

    async fn attempt_webrtc(
        &self,
        stage: Stage,
        state: &StateHandle,
    ) -> Result<Arc<dyn PacketTransport>, NetworkError> {
        let discovery = DiscoveryClient::connect(
            &self.config.discovery.server,
            self.config.discovery.port,
            Some(self.config.discovery.service_key.as_str()).filter(|k| !k.is_empty()),
            Duration::from_secs(5),
        )
        .await
        .map_err(discovery_to_network)?;

        let password = &self.config.crypto.password;
        let joined = discovery
            .join(
                &self.config.connection.session_string,
                (!password.is_empty()).then_some(password.as_str()),
            )
            .await
            .map_err(discovery_to_network)?;

        state.set(match stage {
            Stage::WebrtcStun => ConnectionState::WebrtcStunSignaling,
            _ => ConnectionState::WebrtcTurnSignaling,
        });

        let ice = self.ice_config_for(stage, &joined);
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let (ready_tx, mut ready_rx) = mpsc::channel(1);
        let peer = PeerManager::new(ice, joined.session_id, signal_tx, ready_tx)
            .await?;

        // Offer toward the session host (nil recipient = host).
        peer.connect(Uuid::nil()).await?;

        let transport = loop {
            tokio::select! {
                // Our SDP/ICE out through the discovery relay.
                Some(packet) = signal_rx.recv() => {
                    if let Err(e) = discovery.send_signal(&packet).await {
                        peer.close().await;
                        discovery.close().await;
                        return Err(discovery_to_network(e));
                    }
                }
                // Peer's SDP/ICE back from the relay.
                inbound = discovery.next_signal(Duration::from_secs(30)) => {
                    let packet = match inbound {
                        Ok(p) => p,
                        Err(e) => {
                            peer.close().await;
                            discovery.close().await;
                            return Err(discovery_to_network(e));
                        }
                    };
                    let result = match &packet {
                        Packet::WebRtcSdp { sdp_kind, sdp, .. } => {
                            peer.handle_remote_sdp(*sdp_kind, sdp).await
                        }
                        Packet::WebRtcIce { candidate, sdp_mid, sdp_mline_index, .. } => {
                            peer.handle_remote_ice(candidate, sdp_mid, *sdp_mline_index).await
                        }
                        _ => Ok(()),
                    };
                    if let Err(e) = result {
                        peer.close().await;
                        discovery.close().await;
                        return Err(e);
                    }
                }
                // Data channel opened: the stage is done.
                Some(transport) = ready_rx.recv() => {
                    break transport;
                }
            }
        };

        // Signalling served its purpose.
        discovery.close().await;
        *self.joined.lock() = Some(joined);
        *self.peer.lock() = Some(peer);
        Ok(transport as Arc<dyn PacketTransport>)
    }

    fn ice_config_for(
        &self,
        stage: Stage,
        joined: &crate::discovery::JoinedSession,
    ) -> PeerIceConfig {
        let ice = &self.config.ice;
        match stage {
            Stage::WebrtcStun => PeerIceConfig {
                stun_servers: ice.stun_servers.clone(),
                ..Default::default()
            },
            _ => {
                // TURN credentials handed out on join win over static config.
                let (username, credential) = match &joined.turn {
                    Some(t) => (t.username.clone(), t.password.clone()),
                    None => (ice.turn_username.clone(), ice.turn_credential.clone()),
                };
                PeerIceConfig {
                    stun_servers: Vec::new(),
                    turn_servers: ice.turn_servers.clone(),
                    turn_username: username,
                    turn_credential: credential,
                    relay_only: true,
                }
            }
        }
    }
}

fn discovery_to_network(e: DiscoveryError) -> NetworkError {
    match e {
        DiscoveryError::Transport(crate::transport::TransportError::Net(net)) => net,
        other => NetworkError::Io(std::io::Error::other(other)),
    }
}

#[async_trait]
impl StageDriver for NetworkStageDriver {
    async fn attempt(
        &self,
        stage: Stage,
        state: &StateHandle,
    ) -> Result<Arc<dyn PacketTransport>, NetworkError> {
        match stage {
            Stage::DirectTcp => self.attempt_direct_tcp().await,
            Stage::WebrtcStun | Stage::WebrtcTurn => self.attempt_webrtc(stage, state).await,
        }
    }
}
