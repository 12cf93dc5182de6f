//! WebRTC peer manager: a data-channel-only peer connection used as a
//! packet transport when direct TCP cannot reach the session host.
//!
//! The manager drives ICE gathering (server-reflexive via STUN, relayed
//! via TURN), produces the SDP offer, and forwards its half of the
//! signalling exchange through an injected channel of typed packets. When
//! the data channel opens, ownership of the ready transport passes to the
//! caller through `transport_ready`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::ice_transport::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use glyphchat_protocol::error::NetworkError;
use glyphchat_protocol::packet::{Packet, SdpKind};

use crate::transport::datachannel::DataChannelTransport;

const DATA_CHANNEL_LABEL: &str = "glyph-packets";

/// ICE configuration for one connection stage.
#[derive(Debug, Clone, Default)]
pub struct PeerIceConfig {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<String>,
    pub turn_username: String,
    pub turn_credential: String,
    /// Restrict candidates to TURN relays (the final fallback stage).
    pub relay_only: bool,
}

impl PeerIceConfig {
    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = Vec::new();
        if !self.stun_servers.is_empty() {
            servers.push(RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            });
        }
        if !self.turn_servers.is_empty() {
            servers.push(RTCIceServer {
                urls: self.turn_servers.clone(),
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
            });
        }
        servers
    }
}

pub struct PeerManager {
    pc: Arc<RTCPeerConnection>,
    transport: Arc<DataChannelTransport>,
    session_id: Uuid,
    /// Shared with the ICE callback so candidates gathered after
    /// `connect()` carry the right recipient.
    recipient_id: Arc<parking_lot::Mutex<Uuid>>,
    signal_tx: mpsc::UnboundedSender<Packet>,
}

impl PeerManager {
    /// Build the peer connection and its data channel.
    ///
    /// `signal_tx` receives the outbound half of the signalling exchange
    /// (SDP offers and ICE candidates as typed packets); the caller relays
    /// them to the discovery service. `transport_ready` fires once, when
    /// the data channel opens, handing over the ready transport.
    pub async fn new(
        ice: PeerIceConfig,
        session_id: Uuid,
        signal_tx: mpsc::UnboundedSender<Packet>,
        transport_ready: mpsc::Sender<Arc<DataChannelTransport>>,
    ) -> Result<Self, NetworkError> {
        let api = APIBuilder::new().build();
        let config = RTCConfiguration {
            ice_servers: ice.ice_servers(),
            ice_transport_policy: if ice.relay_only {
                RTCIceTransportPolicy::Relay
            } else {
                RTCIceTransportPolicy::All
            },
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| NetworkError::Io(std::io::Error::other(e)))?,
        );

        pc.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Failed => warn!("peer connection failed"),
                RTCPeerConnectionState::Disconnected => warn!("peer connection disconnected"),
                _ => debug!(?state, "peer connection state"),
            }
            Box::pin(async {})
        }));

        // Reliable, ordered channel: the packet protocol assumes wire order.
        let channel = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| NetworkError::Io(std::io::Error::other(e)))?;

        // Wire the message pump before any SDP goes out so the first
        // packet cannot race the callback registration.
        let transport = Arc::new(DataChannelTransport::new(Arc::clone(&channel)));

        let ready_transport = Arc::clone(&transport);
        channel.on_open(Box::new(move || {
            info!("data channel open");
            let ready_transport = Arc::clone(&ready_transport);
            let transport_ready = transport_ready.clone();
            Box::pin(async move {
                let _ = transport_ready.send(ready_transport).await;
            })
        }));

        let manager = Self {
            pc,
            transport,
            session_id,
            recipient_id: Arc::new(parking_lot::Mutex::new(Uuid::nil())),
            signal_tx,
        };
        manager.wire_ice_candidates();
        Ok(manager)
    }

    fn wire_ice_candidates(&self) {
        let signal_tx = self.signal_tx.clone();
        let session_id = self.session_id;
        let recipient_for_cb = Arc::clone(&self.recipient_id);
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(json) => {
                        let packet = Packet::WebRtcIce {
                            session_id,
                            recipient_id: *recipient_for_cb.lock(),
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid.unwrap_or_default(),
                            sdp_mline_index: json.sdp_mline_index.unwrap_or_default(),
                        };
                        let _ = signal_tx.send(packet);
                    }
                    Err(e) => warn!("failed to serialize ICE candidate: {e}"),
                }
            }
            Box::pin(async {})
        }));
    }

    /// Start connecting to a session participant (nil id = the host).
    /// Produces the SDP offer and pushes it into the signalling channel.
    pub async fn connect(&self, recipient_id: Uuid) -> Result<(), NetworkError> {
        *self.recipient_id.lock() = recipient_id;

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| NetworkError::Io(std::io::Error::other(e)))?;
        let sdp_text = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| NetworkError::Io(std::io::Error::other(e)))?;

        debug!(len = sdp_text.len(), "sending SDP offer");
        let _ = self.signal_tx.send(Packet::WebRtcSdp {
            session_id: self.session_id,
            recipient_id,
            sdp_kind: SdpKind::Offer,
            sdp: sdp_text,
        });
        Ok(())
    }

    /// Remote SDP arrived from the signalling path.
    pub async fn handle_remote_sdp(
        &self,
        sdp_kind: SdpKind,
        sdp: &str,
    ) -> Result<(), NetworkError> {
        let description = match sdp_kind {
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
        }
        .map_err(|e| NetworkError::Io(std::io::Error::other(e)))?;

        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| NetworkError::Io(std::io::Error::other(e)))?;
        debug!(?sdp_kind, "remote description installed");

        // Answer inbound offers so the listening role works too.
        if sdp_kind == SdpKind::Offer {
            let answer = self
                .pc
                .create_answer(None)
                .await
                .map_err(|e| NetworkError::Io(std::io::Error::other(e)))?;
            let sdp_text = answer.sdp.clone();
            self.pc
                .set_local_description(answer)
                .await
                .map_err(|e| NetworkError::Io(std::io::Error::other(e)))?;
            let _ = self.signal_tx.send(Packet::WebRtcSdp {
                session_id: self.session_id,
                recipient_id: *self.recipient_id.lock(),
                sdp_kind: SdpKind::Answer,
                sdp: sdp_text,
            });
        }
        Ok(())
    }

    /// Remote ICE candidate arrived from the signalling path.
    pub async fn handle_remote_ice(
        &self,
        candidate: &str,
        sdp_mid: &str,
        sdp_mline_index: u16,
    ) -> Result<(), NetworkError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: Some(sdp_mid.to_string()),
            sdp_mline_index: Some(sdp_mline_index),
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| NetworkError::Io(std::io::Error::other(e)))?;
        debug!(candidate, "ICE candidate added");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.pc.connection_state() == RTCPeerConnectionState::Connected
    }

    /// The not-yet-open transport (handed out again via `transport_ready`
    /// once the channel opens).
    pub fn transport(&self) -> Arc<DataChannelTransport> {
        Arc::clone(&self.transport)
    }

    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("peer connection close: {e}");
        }
    }

    /// Expose the raw channel for diagnostics.
    pub fn data_channel_label(&self) -> &str {
        DATA_CHANNEL_LABEL
    }
}

impl std::fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerManager")
            .field("session_id", &self.session_id)
            .field("state", &self.pc.connection_state())
            .finish()
    }
}
