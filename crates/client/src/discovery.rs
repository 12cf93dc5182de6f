//! Discovery-service RPC client.
//!
//! The discovery service (ACDS) maps 3-word session strings to session
//! endpoints and relays WebRTC signalling between participants. All RPC
//! runs over ordinary framed packets on a normal transport; when a service
//! key fingerprint is pinned, the channel is first upgraded with the
//! regular handshake.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use glyphchat_protocol::error::{CodecError, CryptoError, NetworkError};
use glyphchat_protocol::packet::{Packet, TurnCredentials, kind};
use glyphchat_protocol::wire;

use crate::crypto::CryptoSession;
use crate::crypto::handshake::{ClientHandshake, HandshakeError};
use crate::transport::tcp::TcpTransport;
use crate::transport::{PacketTransport, TransportError, recv_timeout};

const RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("discovery handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("discovery service error {code}: {message}")]
    Service { code: u16, message: String },
    #[error("unexpected {0} from discovery service")]
    Unexpected(&'static str),
}

impl From<NetworkError> for DiscoveryError {
    fn from(e: NetworkError) -> Self {
        DiscoveryError::Transport(TransportError::Net(e))
    }
}

/// A successful session join: where the session host lives, who we are
/// inside the session, and relay credentials when the service grants them.
#[derive(Debug, Clone)]
pub struct JoinedSession {
    pub session_id: Uuid,
    pub participant_id: Uuid,
    pub server_address: String,
    pub server_port: u16,
    pub turn: Option<TurnCredentials>,
}

pub struct DiscoveryClient {
    transport: Arc<dyn PacketTransport>,
    crypto: Option<Arc<CryptoSession>>,
}

impl DiscoveryClient {
    /// Dial the discovery service. A pinned `service_key` fingerprint
    /// upgrades the channel to an encrypted session before any RPC.
    pub async fn connect(
        host: &str,
        port: u16,
        service_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, DiscoveryError> {
        let transport: Arc<dyn PacketTransport> =
            Arc::new(TcpTransport::connect(host, port, timeout).await?);
        Self::over_transport(transport, host, port, service_key).await
    }

    /// Wrap an already-connected transport (used by tests).
    pub async fn over_transport(
        transport: Arc<dyn PacketTransport>,
        host: &str,
        port: u16,
        service_key: Option<&str>,
    ) -> Result<Self, DiscoveryError> {
        let crypto = match service_key {
            Some(fingerprint) if !fingerprint.is_empty() => {
                let mut handshake = ClientHandshake::new(host, port);
                handshake.expected_fingerprint = Some(fingerprint.to_string());
                let outcome = handshake.run(transport.as_ref()).await?;
                outcome.crypto
            }
            _ => None,
        };
        Ok(Self { transport, crypto })
    }

    async fn recv_packet(&self, timeout: Duration) -> Result<Packet, DiscoveryError> {
        loop {
            let (packet_kind, payload) = recv_timeout(self.transport.as_ref(), timeout).await?;
            let packet = Packet::decode(packet_kind, &payload)?;
            match packet {
                Packet::Encrypted { nonce, ciphertext } => {
                    let Some(crypto) = &self.crypto else {
                        return Err(DiscoveryError::Unexpected("Encrypted"));
                    };
                    let plain = crypto
                        .open(&nonce, &ciphertext)
                        .map_err(TransportError::Crypto)?;
                    let (inner_kind, inner_payload) =
                        wire::parse_frame(&plain).map_err(NetworkError::Wire)?;
                    return Ok(Packet::decode(inner_kind, inner_payload)?);
                }
                // Same downgrade rule as the session dispatcher: with a
                // key installed, only handshake kinds may arrive bare.
                other
                    if self.crypto.is_some() && !Packet::is_cleartext_kind(other.kind()) =>
                {
                    return Err(TransportError::Crypto(CryptoError::Verification(format!(
                        "plaintext {} on encrypted discovery channel",
                        Packet::kind_name(other.kind())
                    )))
                    .into());
                }
                Packet::Ping => {
                    self.transport.send(&Packet::Pong).await?;
                    continue;
                }
                Packet::Pong => continue,
                other => return Ok(other),
            }
        }
    }

    /// Look a session up without joining it.
    pub async fn lookup(&self, session_string: &str) -> Result<(Uuid, u32), DiscoveryError> {
        self.transport
            .send(&Packet::SessionLookup {
                session_string: session_string.to_string(),
            })
            .await?;
        match self.recv_packet(RPC_TIMEOUT).await? {
            Packet::SessionInfo {
                session_id,
                participant_count,
                ..
            } => Ok((session_id, participant_count)),
            Packet::SessionError { code, message } => {
                Err(DiscoveryError::Service { code, message })
            }
            other => {
                warn!(kind = Packet::kind_name(other.kind()), "unexpected lookup reply");
                Err(DiscoveryError::Unexpected(Packet::kind_name(other.kind())))
            }
        }
    }

    /// Join a session by its 3-word string.
    pub async fn join(
        &self,
        session_string: &str,
        password: Option<&str>,
    ) -> Result<JoinedSession, DiscoveryError> {
        self.transport
            .send(&Packet::SessionJoin {
                session_string: session_string.to_string(),
                password: password.map(str::to_string),
            })
            .await?;
        match self.recv_packet(RPC_TIMEOUT).await? {
            Packet::SessionJoined {
                session_id,
                participant_id,
                server_address,
                server_port,
                turn,
            } => {
                debug!(
                    %session_id,
                    %participant_id,
                    server = %server_address,
                    server_port,
                    has_turn = turn.is_some(),
                    "joined session"
                );
                Ok(JoinedSession {
                    session_id,
                    participant_id,
                    server_address,
                    server_port,
                    turn,
                })
            }
            Packet::SessionError { code, message } => {
                Err(DiscoveryError::Service { code, message })
            }
            other => Err(DiscoveryError::Unexpected(Packet::kind_name(other.kind()))),
        }
    }

    /// Relay one of our signalling packets (SDP or ICE) to a participant.
    pub async fn send_signal(&self, packet: &Packet) -> Result<(), DiscoveryError> {
        debug_assert!(matches!(
            packet.kind(),
            kind::WEBRTC_SDP | kind::WEBRTC_ICE
        ));
        self.transport.send(packet).await?;
        Ok(())
    }

    /// Wait for the next inbound signalling packet. Non-signalling
    /// packets in steady state are logged and dropped.
    pub async fn next_signal(&self, timeout: Duration) -> Result<Packet, DiscoveryError> {
        loop {
            let packet = self.recv_packet(timeout).await?;
            match packet {
                Packet::WebRtcSdp { .. } | Packet::WebRtcIce { .. } => return Ok(packet),
                Packet::SessionError { code, message } => {
                    return Err(DiscoveryError::Service { code, message });
                }
                other => {
                    debug!(
                        kind = Packet::kind_name(other.kind()),
                        "ignoring non-signalling packet from discovery"
                    );
                }
            }
        }
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}
