//! Direct TCP transport: wire framing straight on the socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use glyphchat_protocol::error::NetworkError;
use glyphchat_protocol::packet::Packet;
use glyphchat_protocol::wire;

use super::{PacketTransport, TransportError, encode_outbound};
use crate::crypto::CryptoSession;

pub struct TcpTransport {
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    crypto: parking_lot::Mutex<Option<Arc<CryptoSession>>>,
    closed: AtomicBool,
    peer: String,
}

impl TcpTransport {
    /// Connect with a deadline. Disables Nagle: media frames are written
    /// whole and latency matters more than coalescing.
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, NetworkError> {
        let addr = format!("{host}:{port}");
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(NetworkError::Connect {
                    addr,
                    source: e,
                });
            }
            Err(_) => return Err(NetworkError::Timeout(timeout)),
        };
        stream.set_nodelay(true).ok();
        Ok(Self::from_stream(stream, addr))
    }

    pub fn from_stream(stream: TcpStream, peer: String) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            crypto: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
            peer,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl PacketTransport for TcpTransport {
    async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::Closed.into());
        }
        let crypto = self.crypto.lock().clone();
        let frame = encode_outbound(packet, crypto.as_deref())?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(NetworkError::Io)?;
        writer.flush().await.map_err(NetworkError::Io)?;
        Ok(())
    }

    async fn recv(&self) -> Result<(u16, Vec<u8>), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::Closed.into());
        }
        let mut reader = self.reader.lock().await;
        wire::read_packet(&mut *reader)
            .await
            .map_err(|e| NetworkError::Wire(e).into())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn set_crypto(&self, crypto: Arc<CryptoSession>) {
        *self.crypto.lock() = Some(crypto);
    }

    fn label(&self) -> &str {
        "tcp"
    }
}
