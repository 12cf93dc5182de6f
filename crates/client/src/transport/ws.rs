//! WebSocket transport: one binary message per framed packet.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use glyphchat_protocol::error::NetworkError;
use glyphchat_protocol::packet::Packet;
use glyphchat_protocol::wire::{self, MAX_PACKET_SIZE};

use super::{PacketTransport, TransportError, encode_outbound};
use crate::crypto::CryptoSession;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsTransport {
    tx: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    rx: tokio::sync::Mutex<SplitStream<WsStream>>,
    crypto: parking_lot::Mutex<Option<Arc<CryptoSession>>>,
    closed: AtomicBool,
}

impl WsTransport {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, NetworkError> {
        let config = WebSocketConfig::default()
            .max_message_size(Some(MAX_PACKET_SIZE + wire::HEADER_SIZE))
            .max_frame_size(Some(MAX_PACKET_SIZE + wire::HEADER_SIZE));
        let connect = tokio_tungstenite::connect_async_with_config(url, Some(config), false);
        let (stream, _response) = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => {
                return Err(NetworkError::Connect {
                    addr: url.to_string(),
                    source: std::io::Error::other(e),
                });
            }
            Err(_) => return Err(NetworkError::Timeout(timeout)),
        };
        let (tx, rx) = stream.split();
        Ok(Self {
            tx: tokio::sync::Mutex::new(tx),
            rx: tokio::sync::Mutex::new(rx),
            crypto: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl PacketTransport for WsTransport {
    async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::Closed.into());
        }
        let crypto = self.crypto.lock().clone();
        let frame = encode_outbound(packet, crypto.as_deref())?;
        let mut tx = self.tx.lock().await;
        tx.send(Message::binary(frame))
            .await
            .map_err(|e| NetworkError::Io(std::io::Error::other(e)))?;
        Ok(())
    }

    async fn recv(&self) -> Result<(u16, Vec<u8>), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::Closed.into());
        }
        let mut rx = self.rx.lock().await;
        loop {
            match rx.next().await {
                Some(Ok(Message::Binary(body))) => {
                    let (kind, payload) = wire::parse_frame(&body).map_err(NetworkError::Wire)?;
                    return Ok((kind, payload.to_vec()));
                }
                // Control frames are the socket's own business.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Text(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(NetworkError::Closed.into());
                }
                Some(Err(e)) => {
                    return Err(NetworkError::Io(std::io::Error::other(e)).into());
                }
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut tx = self.tx.lock().await;
        let _ = tx.send(Message::Close(None)).await;
        let _ = tx.close().await;
    }

    fn set_crypto(&self, crypto: Arc<CryptoSession>) {
        *self.crypto.lock() = Some(crypto);
    }

    fn label(&self) -> &str {
        "ws"
    }
}
