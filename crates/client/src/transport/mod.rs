//! Transport abstraction: one contract over TCP, WebSocket and WebRTC
//! data channels.
//!
//! Every transport carries whole framed packets. A transport may hold a
//! reference to the session's crypto state; once set, outbound packets are
//! wrapped in an encrypted envelope except for the pre-handshake cleartext
//! kinds. Inbound envelopes are surfaced as-is — decryption belongs to the
//! receive/dispatch path, which re-enters the codec on the plaintext.

pub mod datachannel;
pub mod tcp;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use glyphchat_protocol::error::{CryptoError, NetworkError};
use glyphchat_protocol::packet::Packet;
use glyphchat_protocol::wire;

use crate::crypto::CryptoSession;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Net(#[from] NetworkError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl TransportError {
    /// True when the peer is gone and the connection-lost path should run.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TransportError::Net(NetworkError::Closed)
                | TransportError::Net(NetworkError::Wire(
                    glyphchat_protocol::error::WireError::Disconnected
                ))
        )
    }
}

#[async_trait]
pub trait PacketTransport: Send + Sync {
    /// Send one packet, atomic from the peer's perspective.
    async fn send(&self, packet: &Packet) -> Result<(), TransportError>;

    /// Receive one packet as `(type, payload)`, blocking until a full
    /// frame is available. `Closed`/`Disconnected` on clean close.
    async fn recv(&self) -> Result<(u16, Vec<u8>), TransportError>;

    /// Shut the channel down; subsequent send/receive fail closed.
    async fn close(&self);

    /// Install the session crypto; outbound packets are enveloped from
    /// here on (cleartext handshake kinds excepted).
    fn set_crypto(&self, crypto: Arc<CryptoSession>);

    /// Debug label carried by long-lived transports ("tcp", "ws", ...).
    fn label(&self) -> &str;
}

/// Encode a packet for the wire, sealing it when crypto is installed.
pub(crate) fn encode_outbound(
    packet: &Packet,
    crypto: Option<&CryptoSession>,
) -> Result<Vec<u8>, TransportError> {
    match crypto {
        Some(session) if !Packet::is_cleartext_kind(packet.kind()) => {
            let inner = packet.to_frame();
            let envelope = session.seal(&inner)?;
            Ok(envelope.to_frame())
        }
        _ => Ok(packet.to_frame()),
    }
}

/// Receive with a deadline; elapsing maps to `NetworkError::Timeout`.
pub async fn recv_timeout(
    transport: &dyn PacketTransport,
    timeout: Duration,
) -> Result<(u16, Vec<u8>), TransportError> {
    match tokio::time::timeout(timeout, transport.recv()).await {
        Ok(result) => result,
        Err(_) => Err(NetworkError::Timeout(timeout).into()),
    }
}

/// In-memory transport pair. One side's sends become the other's receives;
/// used by the handshake and orchestrator tests as the simulated peer.
pub struct MemoryTransport {
    tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    crypto: parking_lot::Mutex<Option<Arc<CryptoSession>>>,
    label: String,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                tx: parking_lot::Mutex::new(Some(a_tx)),
                rx: tokio::sync::Mutex::new(b_rx),
                crypto: parking_lot::Mutex::new(None),
                label: "mem-a".to_string(),
            },
            MemoryTransport {
                tx: parking_lot::Mutex::new(Some(b_tx)),
                rx: tokio::sync::Mutex::new(a_rx),
                crypto: parking_lot::Mutex::new(None),
                label: "mem-b".to_string(),
            },
        )
    }
}

#[async_trait]
impl PacketTransport for MemoryTransport {
    async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        let crypto = self.crypto.lock().clone();
        let frame = encode_outbound(packet, crypto.as_deref())?;
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| NetworkError::Closed.into()),
            None => Err(NetworkError::Closed.into()),
        }
    }

    async fn recv(&self) -> Result<(u16, Vec<u8>), TransportError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(frame) => {
                let (kind, payload) = wire::parse_frame(&frame).map_err(NetworkError::Wire)?;
                Ok((kind, payload.to_vec()))
            }
            None => Err(NetworkError::Closed.into()),
        }
    }

    async fn close(&self) {
        self.tx.lock().take();
    }

    fn set_crypto(&self, crypto: Arc<CryptoSession>) {
        *self.crypto.lock() = Some(crypto);
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{SessionKey, derive_session_key, generate_ephemeral};
    use glyphchat_protocol::packet::kind;

    fn test_crypto_pair() -> (Arc<CryptoSession>, Arc<CryptoSession>) {
        let (sa, pa) = generate_ephemeral();
        let (sb, pb) = generate_ephemeral();
        let shared = sa.diffie_hellman(&pb);
        let key = derive_session_key(shared.as_bytes(), &pa, &pb);
        let other = {
            let shared = sb.diffie_hellman(&pa);
            derive_session_key(shared.as_bytes(), &pa, &pb)
        };
        (
            Arc::new(CryptoSession::new(key)),
            Arc::new(CryptoSession::new(other)),
        )
    }

    #[tokio::test]
    async fn memory_pair_roundtrip() {
        let (a, b) = MemoryTransport::pair();
        a.send(&Packet::Ping).await.unwrap();
        let (k, payload) = b.recv().await.unwrap();
        assert_eq!(k, kind::PING);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn closed_transport_fails_both_ways() {
        let (a, b) = MemoryTransport::pair();
        a.close().await;
        assert!(a.send(&Packet::Ping).await.is_err());
        // b's receive stream from a is closed.
        assert!(b.recv().await.unwrap_err().is_disconnect());
    }

    #[tokio::test]
    async fn crypto_envelopes_non_handshake_kinds() {
        let (a, b) = MemoryTransport::pair();
        let (ca, _cb) = test_crypto_pair();
        a.set_crypto(ca);

        a.send(&Packet::Ping).await.unwrap();
        let (k, _) = b.recv().await.unwrap();
        assert_eq!(k, kind::ENCRYPTED);

        // Handshake kinds stay cleartext even with crypto installed.
        a.send(&Packet::NoEncryption).await.unwrap();
        let (k, _) = b.recv().await.unwrap();
        assert_eq!(k, kind::NO_ENCRYPTION);
    }

    #[tokio::test]
    async fn enveloped_packet_opens_to_inner_frame() {
        let (a, b) = MemoryTransport::pair();
        let (ca, cb) = test_crypto_pair();
        a.set_crypto(ca);

        a.send(&Packet::ServerState { active_clients: 2 }).await.unwrap();
        let (k, payload) = b.recv().await.unwrap();
        assert_eq!(k, kind::ENCRYPTED);
        let Packet::Encrypted { nonce, ciphertext } = Packet::decode(k, &payload).unwrap() else {
            unreachable!()
        };
        let inner = cb.open(&nonce, &ciphertext).unwrap();
        let (ik, ipayload) = wire::parse_frame(&inner).unwrap();
        assert_eq!(
            Packet::decode(ik, ipayload).unwrap(),
            Packet::ServerState { active_clients: 2 }
        );
    }

    #[tokio::test]
    async fn recv_timeout_elapses() {
        let (_a, b) = MemoryTransport::pair();
        let err = recv_timeout(&b, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, TransportError::Net(NetworkError::Timeout(_))));
    }
}
