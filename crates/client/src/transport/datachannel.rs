//! WebRTC data-channel transport: one channel message per framed packet.
//!
//! Constructed by the peer manager once the channel reports open; messages
//! are pumped from the channel callback into an internal queue so `recv`
//! can present the same blocking contract as the socket transports.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::data_channel::RTCDataChannel;

use glyphchat_protocol::error::NetworkError;
use glyphchat_protocol::packet::Packet;
use glyphchat_protocol::wire;

use super::{PacketTransport, TransportError, encode_outbound};
use crate::crypto::CryptoSession;

enum ChannelEvent {
    Frame(Vec<u8>),
    Closed,
}

pub struct DataChannelTransport {
    channel: Arc<RTCDataChannel>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelEvent>>,
    crypto: parking_lot::Mutex<Option<Arc<CryptoSession>>>,
    closed: AtomicBool,
}

impl DataChannelTransport {
    /// Wrap an open data channel. Must be called before any message
    /// arrives (the peer manager wires it inside `on_open`).
    pub fn new(channel: Arc<RTCDataChannel>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let message_tx = tx.clone();
        channel.on_message(Box::new(move |msg| {
            let message_tx = message_tx.clone();
            Box::pin(async move {
                let _ = message_tx.send(ChannelEvent::Frame(msg.data.to_vec()));
            })
        }));

        let close_tx = tx;
        channel.on_close(Box::new(move || {
            let close_tx = close_tx.clone();
            Box::pin(async move {
                let _ = close_tx.send(ChannelEvent::Closed);
            })
        }));

        Self {
            channel,
            events: tokio::sync::Mutex::new(rx),
            crypto: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PacketTransport for DataChannelTransport {
    async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::Closed.into());
        }
        let crypto = self.crypto.lock().clone();
        let frame = encode_outbound(packet, crypto.as_deref())?;
        self.channel
            .send(&Bytes::from(frame))
            .await
            .map_err(|e| NetworkError::Io(std::io::Error::other(e)))?;
        Ok(())
    }

    async fn recv(&self) -> Result<(u16, Vec<u8>), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::Closed.into());
        }
        let mut events = self.events.lock().await;
        match events.recv().await {
            Some(ChannelEvent::Frame(body)) => {
                let (kind, payload) = wire::parse_frame(&body).map_err(NetworkError::Wire)?;
                Ok((kind, payload.to_vec()))
            }
            Some(ChannelEvent::Closed) | None => {
                self.closed.store(true, Ordering::Release);
                Err(NetworkError::Closed.into())
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.channel.close().await;
    }

    fn set_crypto(&self, crypto: Arc<CryptoSession>) {
        *self.crypto.lock() = Some(crypto);
    }

    fn label(&self) -> &str {
        "webrtc"
    }
}
