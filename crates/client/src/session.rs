//! Per-session wiring: the worker topology, the packet handler and the
//! reconnect policy.
//!
//! A connected session owns a fixed set of workers: the send task (drains
//! the outbound queue into the transport), the receive and dispatch tasks,
//! the keepalive task, plus the capture and audio-sender threads. All are
//! created on connect and joined on disconnect; reconnection builds a
//! fresh session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use glyphchat_protocol::config::ClientConfig;
use glyphchat_protocol::packet::{CAP_AUDIO, CAP_VIDEO, Packet, StreamKind};

use crate::audio::jitter::UnderrunStrategy;
use crate::audio::{AudioPipeline, spawn_audio_sender};
use crate::capture::{SourceFactories, select_source, spawn_capture_thread};
use crate::crypto::CryptoSession;
use crate::dispatch::{self, DispatchHandles, PacketHandler};
use crate::keepalive::spawn_keepalive;
use crate::shutdown::ShutdownToken;
use crate::transport::PacketTransport;

const SEND_QUEUE_DEPTH: usize = 64;
const RENDER_QUEUE_DEPTH: usize = 8;

/// Work posted to the renderer (which lives outside this crate).
#[derive(Debug, Clone, PartialEq)]
pub enum RenderEvent {
    Frame {
        width: u32,
        height: u32,
        flags: u32,
        pixels: Vec<u8>,
    },
    Clear,
    PeerCount(u32),
}

/// Reconnect budget: -1 = unlimited, 0 = never, N = N attempts.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub attempts: i32,
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            attempts: config.connection.reconnect_attempts,
            delay: Duration::from_millis(config.connection.reconnect_delay_ms as u64),
        }
    }

    /// Whether reconnect attempt number `attempt` (1-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        match self.attempts {
            a if a < 0 => true,
            0 => false,
            a => attempt <= a as u32,
        }
    }
}

/// The steady-state packet handler: media to the pipelines, control to
/// logs, rekey packets to the crypto context.
struct SessionHandler {
    outbound: mpsc::Sender<Packet>,
    render_tx: mpsc::Sender<RenderEvent>,
    audio: Option<Arc<AudioPipeline>>,
    crypto: Option<Arc<CryptoSession>>,
    connection_lost: ShutdownToken,
}

#[async_trait]
impl PacketHandler for SessionHandler {
    async fn handle(&self, packet: Packet) {
        match packet {
            Packet::Pong => debug!("pong"),
            Packet::Ping => {
                let _ = self.outbound.send(Packet::Pong).await;
            }
            Packet::ServerState { active_clients } => {
                let _ = self.render_tx.try_send(RenderEvent::PeerCount(active_clients));
            }
            Packet::ClearConsole => {
                let _ = self.render_tx.try_send(RenderEvent::Clear);
            }
            Packet::VideoFrame {
                width,
                height,
                flags,
                pixels,
            } => {
                // The renderer drains its own queue; drop frames rather
                // than block dispatch.
                let _ = self.render_tx.try_send(RenderEvent::Frame {
                    width,
                    height,
                    flags,
                    pixels,
                });
            }
            Packet::AudioOpus {
                sample_rate,
                frame_ms,
                frames,
            } => {
                if let Some(audio) = &self.audio {
                    audio.handle_packet(sample_rate, frame_ms, &frames);
                }
            }
            Packet::StreamStart(kind) => info!(?kind, "peer started stream"),
            Packet::StreamStop(kind) => info!(?kind, "peer stopped stream"),
            Packet::RekeyRequest { ephemeral } => {
                let Some(crypto) = &self.crypto else {
                    warn!("rekey request on plaintext session, ignoring");
                    return;
                };
                match crypto.respond_rekey(&ephemeral) {
                    Ok(our_ephemeral) => {
                        info!(epoch = crypto.epoch(), "rekey requested by peer");
                        let _ = self
                            .outbound
                            .send(Packet::RekeyResponse {
                                ephemeral: our_ephemeral,
                            })
                            .await;
                    }
                    Err(e) => warn!("rekey response failed: {e}"),
                }
            }
            Packet::RekeyResponse { ephemeral } => {
                let Some(crypto) = &self.crypto else {
                    warn!("rekey response on plaintext session, ignoring");
                    return;
                };
                match crypto.complete_rekey_request(&ephemeral) {
                    Ok(()) => {
                        // Sealed under the new key by construction.
                        let _ = self.outbound.send(Packet::RekeyComplete).await;
                        info!(epoch = crypto.epoch(), "rekey response accepted");
                    }
                    Err(e) => {
                        warn!("rekey completion failed: {e}; dropping connection");
                        self.connection_lost.trigger();
                    }
                }
            }
            Packet::RekeyComplete => {
                // Commit already happened when this envelope opened under
                // the new key.
                if let Some(crypto) = &self.crypto {
                    info!(epoch = crypto.epoch(), "rekey complete");
                }
            }
            other => {
                debug!(
                    kind = Packet::kind_name(other.kind()),
                    "unhandled packet in steady state"
                );
            }
        }
    }
}

pub struct SessionOptions {
    pub display_name: String,
    pub factories: SourceFactories,
    pub mic: Option<crate::audio::MicConsumer>,
}

/// A running session and the handles needed to tear it down.
pub struct Session {
    pub outbound: mpsc::Sender<Packet>,
    pub render_rx: Option<mpsc::Receiver<RenderEvent>>,
    pub audio: Option<Arc<AudioPipeline>>,
    pub connection_lost: ShutdownToken,
    shutdown: ShutdownToken,
    transport: Arc<dyn PacketTransport>,
    send_task: JoinHandle<()>,
    dispatch: DispatchHandles,
    keepalive: JoinHandle<()>,
    capture_thread: Option<std::thread::JoinHandle<()>>,
    audio_thread: Option<std::thread::JoinHandle<()>>,
}

impl Session {
    /// Wire up the full worker set over an established, handshaken
    /// transport and announce ourselves with ClientJoin.
    pub async fn start(
        config: &ClientConfig,
        transport: Arc<dyn PacketTransport>,
        crypto: Option<Arc<CryptoSession>>,
        options: SessionOptions,
        shutdown: ShutdownToken,
    ) -> anyhow::Result<Session> {
        let connection_lost = ShutdownToken::new();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Packet>(SEND_QUEUE_DEPTH);
        let (render_tx, render_rx) = mpsc::channel::<RenderEvent>(RENDER_QUEUE_DEPTH);

        let audio = if config.audio.enabled {
            Some(Arc::new(AudioPipeline::new(
                config.audio.jitter_margin_ms,
                UnderrunStrategy::Silence,
            )?))
        } else {
            None
        };

        // Send task: the single writer on this transport.
        let send_task = {
            let transport = Arc::clone(&transport);
            let lost = connection_lost.clone();
            let task_shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let packet = tokio::select! {
                        packet = outbound_rx.recv() => packet,
                        _ = task_shutdown.wait() => None,
                    };
                    let Some(packet) = packet else {
                        return;
                    };
                    if let Err(e) = transport.send(&packet).await {
                        if e.is_disconnect() {
                            info!("transport closed while sending");
                        } else {
                            warn!("send failed: {e}");
                        }
                        lost.trigger();
                        return;
                    }
                }
            })
        };

        let handler = Arc::new(SessionHandler {
            outbound: outbound_tx.clone(),
            render_tx,
            audio: audio.clone(),
            crypto: crypto.clone(),
            connection_lost: connection_lost.clone(),
        });
        let dispatch = dispatch::spawn(
            Arc::clone(&transport),
            crypto.clone(),
            handler,
            shutdown.clone(),
            connection_lost.clone(),
        );

        let keepalive = spawn_keepalive(
            outbound_tx.clone(),
            crypto.clone(),
            shutdown.clone(),
            connection_lost.clone(),
        );

        // Pick media sources before announcing: the join packet carries
        // the capabilities we can actually deliver, and it must hit the
        // wire before the first frame does.
        let video_source = match select_source(&config.media, &options.factories) {
            Ok(source) => Some(source),
            Err(e) => {
                warn!("video capture unavailable: {e}. Continuing without video.");
                None
            }
        };
        let mut capabilities = 0u32;
        if video_source.is_some() {
            capabilities |= CAP_VIDEO;
        }
        let audio_ready = config.audio.enabled && options.mic.is_some() && audio.is_some();
        if audio_ready {
            capabilities |= CAP_AUDIO;
        }

        outbound_tx
            .send(Packet::ClientJoin {
                display_name: options.display_name.clone(),
                capabilities,
            })
            .await
            .map_err(|_| anyhow::anyhow!("session send queue closed before join"))?;
        if capabilities & CAP_VIDEO != 0 {
            let _ = outbound_tx.send(Packet::StreamStart(StreamKind::Video)).await;
        }
        if capabilities & CAP_AUDIO != 0 {
            let _ = outbound_tx.send(Packet::StreamStart(StreamKind::Audio)).await;
        }

        let capture_thread = match video_source {
            Some(source) => match spawn_capture_thread(
                source,
                config.media.fps,
                outbound_tx.clone(),
                shutdown.clone(),
                connection_lost.clone(),
            ) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("failed to start capture thread: {e}");
                    None
                }
            },
            None => None,
        };

        let audio_thread = match (audio_ready, options.mic, &audio) {
            (true, Some(mic), Some(pipeline)) => {
                match spawn_audio_sender(
                    mic,
                    pipeline.echo_canceller(),
                    Vec::new(),
                    outbound_tx.clone(),
                    shutdown.clone(),
                    connection_lost.clone(),
                ) {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!("audio capture unavailable: {e}. Continuing without audio.");
                        None
                    }
                }
            }
            _ => None,
        };
        info!(
            display_name = %options.display_name,
            video = capabilities & CAP_VIDEO != 0,
            audio = capabilities & CAP_AUDIO != 0,
            "session started"
        );

        Ok(Session {
            outbound: outbound_tx,
            render_rx: Some(render_rx),
            audio,
            connection_lost,
            shutdown,
            transport,
            send_task,
            dispatch,
            keepalive,
            capture_thread,
            audio_thread,
        })
    }

    /// Block until the connection drops or process shutdown begins.
    pub async fn wait(&self) {
        tokio::select! {
            _ = self.connection_lost.wait() => {}
            _ = self.shutdown.wait() => {}
        }
    }

    /// Tear the session down: close the transport, then join every
    /// worker. Safe to call after `wait` returns.
    pub async fn teardown(self) {
        // Unblock anything parked on the transport.
        self.connection_lost.trigger();
        self.transport.close().await;

        let _ = self.keepalive.await;
        let _ = self.send_task.await;
        self.dispatch.join().await;

        // Worker threads poll the tokens; joining them off the runtime
        // keeps the executor responsive.
        let capture = self.capture_thread;
        let audio = self.audio_thread;
        let _ = tokio::task::spawn_blocking(move || {
            if let Some(handle) = capture {
                let _ = handle.join();
            }
            if let Some(handle) = audio {
                let _ = handle.join();
            }
        })
        .await;
        info!("session torn down");
    }
}
