use anyhow::Context;

use glyphchat_protocol::config::{AudioSourceKind, ClientConfig, LogLevel};

pub(crate) struct Args {
    pub config: ClientConfig,
    pub display_name: String,
}

fn default_display_name() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "guest".to_string());
    format!("{user}-{}", std::process::id() % 10_000)
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let argv: Vec<String> = std::env::args().collect();

    // First pass: an explicit config file is the base layer.
    let mut config_path = None;
    let mut i = 1;
    while i < argv.len() {
        if argv[i] == "--config" {
            i += 1;
            config_path = Some(argv.get(i).context("Missing --config value")?.clone());
        }
        i += 1;
    }
    let mut config = match &config_path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {path}"))?;
            toml::from_str::<ClientConfig>(&contents)
                .with_context(|| format!("Failed to parse config file {path}"))?
        }
        None => ClientConfig::default(),
    };
    let mut display_name = default_display_name();

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "-V" | "--version" => {
                println!("glyphchat {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "--config" => {
                i += 1; // handled in the first pass
            }
            "--name" => {
                i += 1;
                display_name = argv.get(i).context("Missing --name value")?.clone();
            }
            "--address" => {
                i += 1;
                config.connection.address =
                    argv.get(i).context("Missing --address value")?.clone();
            }
            "--port" => {
                i += 1;
                config.connection.port = argv
                    .get(i)
                    .context("Missing --port value")?
                    .parse()
                    .context("Invalid --port value")?;
            }
            "--session" => {
                i += 1;
                config.connection.session_string =
                    argv.get(i).context("Missing --session value")?.clone();
            }
            "--reconnect-attempts" => {
                i += 1;
                config.connection.reconnect_attempts = argv
                    .get(i)
                    .context("Missing --reconnect-attempts value")?
                    .parse()
                    .context("Invalid --reconnect-attempts value")?;
            }
            "--reconnect-delay-ms" => {
                i += 1;
                config.connection.reconnect_delay_ms = argv
                    .get(i)
                    .context("Missing --reconnect-delay-ms value")?
                    .parse()
                    .context("Invalid --reconnect-delay-ms value")?;
            }
            "--discovery-server" => {
                i += 1;
                config.discovery.server = argv
                    .get(i)
                    .context("Missing --discovery-server value")?
                    .clone();
            }
            "--discovery-port" => {
                i += 1;
                config.discovery.port = argv
                    .get(i)
                    .context("Missing --discovery-port value")?
                    .parse()
                    .context("Invalid --discovery-port value")?;
            }
            "--discovery-key" => {
                i += 1;
                config.discovery.service_key = argv
                    .get(i)
                    .context("Missing --discovery-key value")?
                    .clone();
            }
            "--stun-server" => {
                i += 1;
                config
                    .ice
                    .stun_servers
                    .push(argv.get(i).context("Missing --stun-server value")?.clone());
            }
            "--turn-server" => {
                i += 1;
                config
                    .ice
                    .turn_servers
                    .push(argv.get(i).context("Missing --turn-server value")?.clone());
            }
            "--turn-username" => {
                i += 1;
                config.ice.turn_username = argv
                    .get(i)
                    .context("Missing --turn-username value")?
                    .clone();
            }
            "--turn-credential" => {
                i += 1;
                config.ice.turn_credential = argv
                    .get(i)
                    .context("Missing --turn-credential value")?
                    .clone();
            }
            "--prefer-webrtc" => config.ice.prefer_webrtc = true,
            "--no-webrtc" => config.ice.no_webrtc = true,
            "--webrtc-skip-stun" => config.ice.skip_stun = true,
            "--webrtc-disable-turn" => config.ice.disable_turn = true,
            "--webrtc-ice-timeout-ms" => {
                i += 1;
                config.ice.ice_timeout_ms = argv
                    .get(i)
                    .context("Missing --webrtc-ice-timeout-ms value")?
                    .parse()
                    .context("Invalid --webrtc-ice-timeout-ms value")?;
            }
            "--fps" => {
                i += 1;
                config.media.fps = argv
                    .get(i)
                    .context("Missing --fps value")?
                    .parse()
                    .context("Invalid --fps value")?;
            }
            "--webcam-index" => {
                i += 1;
                config.media.webcam_index = argv
                    .get(i)
                    .context("Missing --webcam-index value")?
                    .parse()
                    .context("Invalid --webcam-index value")?;
            }
            "--media" => {
                i += 1;
                config.media.media_path = argv.get(i).context("Missing --media value")?.clone();
            }
            "--test-pattern" => config.media.test_pattern = true,
            "--no-audio" => config.audio.enabled = false,
            "--microphone-index" => {
                i += 1;
                config.audio.microphone_index = argv
                    .get(i)
                    .context("Missing --microphone-index value")?
                    .parse()
                    .context("Invalid --microphone-index value")?;
            }
            "--speakers-index" => {
                i += 1;
                config.audio.speakers_index = argv
                    .get(i)
                    .context("Missing --speakers-index value")?
                    .parse()
                    .context("Invalid --speakers-index value")?;
            }
            "--audio-source" => {
                i += 1;
                config.audio.source = match argv
                    .get(i)
                    .context("Missing --audio-source value")?
                    .as_str()
                {
                    "auto" => AudioSourceKind::Auto,
                    "mic" => AudioSourceKind::Mic,
                    "media" => AudioSourceKind::Media,
                    "both" => AudioSourceKind::Both,
                    other => anyhow::bail!("Invalid --audio-source value: {other}"),
                };
            }
            "--password" => {
                i += 1;
                config.crypto.password =
                    argv.get(i).context("Missing --password value")?.clone();
            }
            "--encrypt-key" => {
                i += 1;
                config.crypto.encrypt_key =
                    argv.get(i).context("Missing --encrypt-key value")?.clone();
            }
            "--server-key" => {
                i += 1;
                config.crypto.server_key =
                    argv.get(i).context("Missing --server-key value")?.clone();
            }
            "--known-hosts" => {
                i += 1;
                config.crypto.known_hosts_path =
                    argv.get(i).context("Missing --known-hosts value")?.clone();
            }
            "--client-keys" => {
                i += 1;
                config.crypto.client_keys_path =
                    argv.get(i).context("Missing --client-keys value")?.clone();
            }
            "--no-encrypt" => config.crypto.no_encrypt = true,
            "--log-file" => {
                i += 1;
                config.log.file = argv.get(i).context("Missing --log-file value")?.clone();
            }
            "--log-level" => {
                i += 1;
                config.log.level = match argv
                    .get(i)
                    .context("Missing --log-level value")?
                    .as_str()
                {
                    "dev" => LogLevel::Dev,
                    "debug" => LogLevel::Debug,
                    "info" => LogLevel::Info,
                    "warn" => LogLevel::Warn,
                    "error" => LogLevel::Error,
                    "fatal" => LogLevel::Fatal,
                    other => anyhow::bail!("Invalid --log-level value: {other}"),
                };
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Args {
        config,
        display_name,
    })
}

fn print_help() {
    println!("glyphchat - terminal video chat client");
    println!();
    println!("USAGE:");
    println!("    glyphchat [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <PATH>              TOML configuration file");
    println!("    --name <NAME>                Display name shown to peers");
    println!("    --address <HOST>             Server address [default: 127.0.0.1]");
    println!("    --port <PORT>                Server port [default: 27224]");
    println!("    --session <WORDS>            3-word session string (uses discovery)");
    println!("    --reconnect-attempts <N>     -1 unlimited, 0 never, N attempts [default: 3]");
    println!("    --reconnect-delay-ms <MS>    Delay between reconnects [default: 2000]");
    println!("    --discovery-server <HOST>    Discovery service address");
    println!("    --discovery-port <PORT>      Discovery service port [default: 27225]");
    println!("    --discovery-key <FP>         Expected discovery service fingerprint");
    println!("    --stun-server <URL>          Add a STUN server (repeatable)");
    println!("    --turn-server <URL>          Add a TURN server (repeatable)");
    println!("    --turn-username <USER>       TURN username");
    println!("    --turn-credential <PASS>     TURN credential");
    println!("    --prefer-webrtc              Try WebRTC before direct TCP");
    println!("    --no-webrtc                  Direct TCP only");
    println!("    --webrtc-skip-stun           Skip the STUN stage");
    println!("    --webrtc-disable-turn        Skip the TURN stage");
    println!("    --webrtc-ice-timeout-ms <MS> ICE gathering timeout");
    println!("    --fps <FPS>                  Capture frame rate (0 = probe)");
    println!("    --webcam-index <N>           Webcam device index");
    println!("    --media <PATH|URL|->         Stream a file, URL, or stdin");
    println!("    --test-pattern               Send a generated test pattern");
    println!("    --no-audio                   Disable audio");
    println!("    --microphone-index <N>       Input device index (-1 = default)");
    println!("    --speakers-index <N>         Output device index (-1 = default)");
    println!("    --audio-source <KIND>        auto | mic | media | both");
    println!("    --password <PASS>            Session password");
    println!("    --encrypt-key <PATH>         Identity key file (or gpg:<keyid>)");
    println!("    --server-key <FP>            Expected server key fingerprint");
    println!("    --known-hosts <PATH>         Known-hosts file path");
    println!("    --client-keys <PATH>         Client whitelist file path");
    println!("    --no-encrypt                 Disable encryption");
    println!("    --log-file <PATH>            Append logs to this file");
    println!("    --log-level <LEVEL>          dev|debug|info|warn|error|fatal");
    println!("    -V, --version                Print version and exit");
    println!("    -h, --help                   Print this help and exit");
}
