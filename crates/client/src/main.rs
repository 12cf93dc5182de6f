mod cli;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use glyphchat_protocol::config::{ClientConfig, LogLevel};

use glyphchat_client::connection::{
    NetworkStageDriver, Orchestrator, OrchestratorFlags, StageTimeouts,
};
use glyphchat_client::crypto::handshake::{
    ClientHandshake, HandshakeError, HandshakeState, describe_identity,
};
use glyphchat_client::crypto::identity::{IdentityKeypair, KnownHosts};
use glyphchat_client::session::{ReconnectPolicy, Session, SessionOptions};
use glyphchat_client::shutdown::ShutdownToken;
use glyphchat_client::{capture, logsink};

fn init_logging(config: &ClientConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(match config.log.level {
            LogLevel::Dev => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
        })
    });

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if config.log.file.is_empty() {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
    } else {
        let sink = logsink::MmapSink::create(expand_home(&config.log.file), config.log.level)
            .context("Failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .with(logsink::MmapLayer::new(sink))
            .init();
    }
    Ok(())
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Ok(home) = std::env::var("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}

fn load_identity(config: &ClientConfig) -> anyhow::Result<Option<Arc<IdentityKeypair>>> {
    if !config.encryption_enabled() {
        return Ok(None);
    }
    let path = if config.crypto.encrypt_key.is_empty() {
        expand_home("~/.config/glyphchat/identity")
    } else {
        expand_home(&config.crypto.encrypt_key)
    };
    let keypair = IdentityKeypair::load_or_generate(&path)
        .with_context(|| format!("Failed to load identity key from {}", path.display()))?;
    info!(fingerprint = %keypair.fingerprint(), "client identity loaded");
    Ok(Some(Arc::new(keypair)))
}

fn build_handshake(
    config: &ClientConfig,
    identity: Option<Arc<IdentityKeypair>>,
) -> ClientHandshake {
    let mut handshake =
        ClientHandshake::new(config.connection.address.clone(), config.connection.port);
    handshake.encrypt = config.encryption_enabled();
    handshake.identity = identity;
    if !config.crypto.password.is_empty() {
        handshake.password = Some(config.crypto.password.clone());
    }
    if !config.crypto.server_key.is_empty() {
        handshake.expected_fingerprint = Some(config.crypto.server_key.clone());
    }
    if !config.crypto.known_hosts_path.is_empty() {
        handshake.known_hosts = Some(KnownHosts::open(expand_home(
            &config.crypto.known_hosts_path,
        )));
    }
    handshake
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::parse_args()?;
    let config = args.config;

    if let Err(issues) = config.validate() {
        for issue in &issues {
            eprintln!("{issue}");
        }
        if issues.iter().any(|i| i.starts_with("ERROR:")) {
            anyhow::bail!("configuration is invalid");
        }
    }

    init_logging(&config)?;
    info!(
        address = %config.connection.address,
        port = config.connection.port,
        session = %config.connection.session_string,
        "starting glyphchat"
    );

    let identity = load_identity(&config)?;
    let shutdown = ShutdownToken::new();

    // Ctrl-C triggers the one process-wide shutdown token.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.trigger();
            }
        });
    }

    let policy = ReconnectPolicy::from_config(&config);
    let mut attempt: u32 = 0;

    loop {
        if shutdown.is_triggered() {
            break;
        }

        match run_connection(&config, identity.clone(), &args.display_name, &shutdown).await {
            Ok(()) => {
                // Clean disconnect (peer closed or user quit).
                info!("Disconnected");
                if shutdown.is_triggered() {
                    break;
                }
            }
            Err(e) => {
                if e.downcast_ref::<HandshakeError>()
                    .is_some_and(|h| h.is_auth_failure())
                {
                    // Authentication failures are configuration problems;
                    // retrying cannot fix them.
                    error!("{e:#}");
                    anyhow::bail!("authentication failed");
                }
                warn!("connection failed: {e:#}");
            }
        }

        attempt += 1;
        if !policy.allows(attempt) {
            info!(attempts = attempt - 1, "reconnect budget exhausted");
            break;
        }
        let total = if policy.attempts < 0 {
            "unlimited".to_string()
        } else {
            policy.attempts.to_string()
        };
        info!("Reconnecting (attempt {attempt} of {total})");
        tokio::select! {
            _ = tokio::time::sleep(policy.delay) => {}
            _ = shutdown.wait() => break,
        }
    }

    info!("goodbye");
    Ok(())
}

/// One full connection lifetime: orchestrate, handshake, run the session
/// until it drops.
async fn run_connection(
    config: &ClientConfig,
    identity: Option<Arc<IdentityKeypair>>,
    display_name: &str,
    shutdown: &ShutdownToken,
) -> anyhow::Result<()> {
    let flags = OrchestratorFlags {
        prefer_webrtc: config.ice.prefer_webrtc,
        no_webrtc: config.ice.no_webrtc || config.connection.session_string.is_empty(),
        skip_stun: config.ice.skip_stun,
        disable_turn: config.ice.disable_turn,
    };
    let mut orchestrator = Orchestrator::new(flags, StageTimeouts::default());
    let driver = NetworkStageDriver::new(config.clone());

    let transport = orchestrator
        .establish(&driver, shutdown)
        .await
        .context("connection failed")?;
    if let Some(joined) = driver.joined_session() {
        info!(
            session_id = %joined.session_id,
            participant_id = %joined.participant_id,
            "joined session via discovery"
        );
    }

    let mut handshake = build_handshake(config, identity);
    let outcome = tokio::time::timeout(
        Duration::from_secs(30),
        handshake.run(transport.as_ref()),
    )
    .await
    .map_err(|_| anyhow::anyhow!("handshake deadline exceeded"))??;

    match outcome.state {
        HandshakeState::Ready => {
            if let Some(identity) = &outcome.peer_identity {
                info!(server = %describe_identity(identity), "session encrypted");
            } else {
                info!("session encrypted");
            }
        }
        HandshakeState::Disabled => info!("session running in plaintext"),
        other => anyhow::bail!("handshake ended in unexpected state {other:?}"),
    }

    let session = Session::start(
        config,
        transport,
        outcome.crypto,
        SessionOptions {
            display_name: display_name.to_string(),
            factories: capture::SourceFactories::default(),
            mic: None,
        },
        shutdown.clone(),
    )
    .await?;

    session.wait().await;
    session.teardown().await;
    Ok(())
}
