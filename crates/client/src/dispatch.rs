//! Per-connection receive and dispatch loops.
//!
//! The receive task reads framed packets off the transport, opens
//! encrypted envelopes, and enqueues typed packets on a bounded FIFO. The
//! dispatch task drains the queue and hands packets to the session's
//! handler, so a slow handler cannot stall the transport read and shrink
//! the TCP window. Queue order equals wire order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use glyphchat_protocol::error::CodecError;
use glyphchat_protocol::packet::Packet;
use glyphchat_protocol::wire;

use crate::crypto::CryptoSession;
use crate::shutdown::ShutdownToken;
use crate::transport::PacketTransport;

const DISPATCH_QUEUE_DEPTH: usize = 256;
const DISPATCH_POLL: Duration = Duration::from_millis(250);

/// Session-level packet handler, invoked in wire order.
///
/// Handlers must not block indefinitely; work that can take a while is
/// posted to a component queue and the handler returns.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn handle(&self, packet: Packet);
}

pub struct DispatchHandles {
    pub receive: JoinHandle<()>,
    pub dispatch: JoinHandle<()>,
}

impl DispatchHandles {
    pub async fn join(self) {
        let _ = self.receive.await;
        let _ = self.dispatch.await;
    }
}

/// Spawn the receive and dispatch tasks for one connection.
///
/// `connection_lost` is triggered when the transport disconnects or the
/// crypto layer rejects traffic; the session reacts by tearing down.
pub fn spawn(
    transport: Arc<dyn PacketTransport>,
    crypto: Option<Arc<CryptoSession>>,
    handler: Arc<dyn PacketHandler>,
    shutdown: ShutdownToken,
    connection_lost: ShutdownToken,
) -> DispatchHandles {
    let (queue_tx, queue_rx) = mpsc::channel::<Packet>(DISPATCH_QUEUE_DEPTH);

    let receive = tokio::spawn(receive_loop(
        transport,
        crypto,
        queue_tx,
        shutdown.clone(),
        connection_lost.clone(),
    ));
    let dispatch = tokio::spawn(dispatch_loop(queue_rx, handler, shutdown));

    DispatchHandles { receive, dispatch }
}

async fn receive_loop(
    transport: Arc<dyn PacketTransport>,
    crypto: Option<Arc<CryptoSession>>,
    queue_tx: mpsc::Sender<Packet>,
    shutdown: ShutdownToken,
    connection_lost: ShutdownToken,
) {
    loop {
        let received = tokio::select! {
            received = transport.recv() => received,
            _ = shutdown.wait() => break,
        };

        let (kind, payload) = match received {
            Ok(frame) => frame,
            Err(e) if e.is_disconnect() => {
                info!(transport = transport.label(), "connection closed by peer");
                connection_lost.trigger();
                break;
            }
            Err(e) => {
                error!(transport = transport.label(), "receive failed: {e}");
                connection_lost.trigger();
                break;
            }
        };

        let packet = match decode_inbound(kind, &payload, crypto.as_deref()) {
            Ok(packet) => packet,
            Err(DecodeFailure::UnknownType(t)) => {
                // Unknown control packets in steady state are dropped, not
                // fatal: newer peers may speak newer kinds.
                debug!(kind = %format!("0x{t:04x}"), "dropping unknown packet type");
                continue;
            }
            Err(DecodeFailure::Malformed(e)) => {
                warn!("dropping malformed packet: {e}");
                continue;
            }
            Err(DecodeFailure::CryptoReject(e)) => {
                // A failed envelope open means key desync or tampering;
                // neither is recoverable in-session.
                error!("envelope rejected: {e}; dropping connection");
                connection_lost.trigger();
                break;
            }
        };

        let is_media = matches!(
            packet,
            Packet::VideoFrame { .. } | Packet::AudioOpus { .. }
        );
        match queue_tx.try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(packet)) => {
                if is_media {
                    // Prefer dropping a frame over stalling the socket.
                    debug!("dispatch queue full, dropping media packet");
                } else if queue_tx.send(packet).await.is_err() {
                    break;
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
    // Dropping queue_tx drains the dispatch loop to completion.
}

async fn dispatch_loop(
    mut queue_rx: mpsc::Receiver<Packet>,
    handler: Arc<dyn PacketHandler>,
    shutdown: ShutdownToken,
) {
    loop {
        match tokio::time::timeout(DISPATCH_POLL, queue_rx.recv()).await {
            Ok(Some(packet)) => handler.handle(packet).await,
            Ok(None) => break,
            Err(_) => {
                if shutdown.is_triggered() {
                    break;
                }
            }
        }
    }
}

enum DecodeFailure {
    UnknownType(u16),
    Malformed(CodecError),
    CryptoReject(String),
}

fn decode_inbound(
    kind: u16,
    payload: &[u8],
    crypto: Option<&CryptoSession>,
) -> Result<Packet, DecodeFailure> {
    let packet = decode_one(kind, payload)?;
    match packet {
        Packet::Encrypted { nonce, ciphertext } => {
            let Some(crypto) = crypto else {
                return Err(DecodeFailure::CryptoReject(
                    "encrypted envelope on a plaintext session".into(),
                ));
            };
            let plain = crypto
                .open(&nonce, &ciphertext)
                .map_err(|e| DecodeFailure::CryptoReject(e.to_string()))?;
            let (inner_kind, inner_payload) = wire::parse_frame(&plain)
                .map_err(|e| DecodeFailure::CryptoReject(format!("inner frame: {e}")))?;
            decode_one(inner_kind, inner_payload)
        }
        other => {
            // Once a session key is installed, everything except the
            // handshake kinds must arrive enveloped. A bare packet here
            // is a downgrade attempt, not a peer quirk.
            if crypto.is_some() && !Packet::is_cleartext_kind(other.kind()) {
                return Err(DecodeFailure::CryptoReject(format!(
                    "plaintext {} on an encrypted session",
                    Packet::kind_name(other.kind())
                )));
            }
            Ok(other)
        }
    }
}

fn decode_one(kind: u16, payload: &[u8]) -> Result<Packet, DecodeFailure> {
    match Packet::decode(kind, payload) {
        Ok(packet) => Ok(packet),
        Err(CodecError::UnknownType(t)) => Err(DecodeFailure::UnknownType(t)),
        Err(e) => Err(DecodeFailure::Malformed(e)),
    }
}
