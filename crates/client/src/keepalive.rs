//! Keepalive and rekey scheduler.
//!
//! Sends a PING every 3 seconds (the server's silence timeout is 5, so
//! there is a 2-second margin) and checks the crypto context's rekey
//! thresholds on each wake. Sleeps in 1-second chunks so shutdown is
//! observed promptly. PONGs come back through the normal dispatch path
//! and are not individually awaited.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use glyphchat_protocol::packet::Packet;

use crate::crypto::CryptoSession;
use crate::shutdown::ShutdownToken;

pub const PING_INTERVAL: Duration = Duration::from_secs(3);
const WAKE_INTERVAL: Duration = Duration::from_secs(1);

pub fn spawn_keepalive(
    outbound: mpsc::Sender<Packet>,
    crypto: Option<Arc<CryptoSession>>,
    shutdown: ShutdownToken,
    connection_lost: ShutdownToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_ping = Instant::now() - PING_INTERVAL; // ping immediately
        loop {
            if shutdown.is_triggered() || connection_lost.is_triggered() {
                info!("keepalive stopping");
                return;
            }

            if last_ping.elapsed() >= PING_INTERVAL {
                if outbound.send(Packet::Ping).await.is_err() {
                    info!("send queue closed, keepalive exiting");
                    return;
                }
                debug!("ping sent");
                last_ping = Instant::now();
            }

            if let Some(crypto) = &crypto
                && crypto.needs_rekey()
            {
                match crypto.begin_rekey() {
                    Ok(ephemeral) => {
                        info!(
                            epoch = crypto.epoch(),
                            bytes = crypto.bytes_since_rekey(),
                            "rekey threshold crossed, requesting new keys"
                        );
                        if outbound
                            .send(Packet::RekeyRequest { ephemeral })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => warn!("rekey initiation failed: {e}"),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(WAKE_INTERVAL) => {}
                _ = shutdown.wait() => return,
                _ = connection_lost.wait() => return,
            }
        }
    })
}
