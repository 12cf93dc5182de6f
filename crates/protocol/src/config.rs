use serde::{Deserialize, Serialize};

/// Top-level client configuration (TOML file; CLI flags override).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Server endpoint when not using discovery.
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// 3-word session identifier when using discovery (empty = direct).
    #[serde(default)]
    pub session_string: String,
    /// -1 = unlimited, 0 = never retry, N = N attempts.
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: i32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_server")]
    pub server: String,
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    /// Expected discovery-service key fingerprint (out-of-band pin).
    #[serde(default)]
    pub service_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    #[serde(default)]
    pub turn_servers: Vec<String>,
    #[serde(default)]
    pub turn_username: String,
    #[serde(default)]
    pub turn_credential: String,
    #[serde(default)]
    pub prefer_webrtc: bool,
    #[serde(default)]
    pub no_webrtc: bool,
    #[serde(default)]
    pub skip_stun: bool,
    #[serde(default)]
    pub disable_turn: bool,
    #[serde(default = "default_ice_timeout_ms")]
    pub ice_timeout_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Target frame rate; 0 = probe the source (fall back to 60).
    #[serde(default)]
    pub fps: u32,
    #[serde(default)]
    pub webcam_index: u32,
    /// Media file or URL to stream instead of the webcam ("-" = stdin).
    #[serde(default)]
    pub media_path: String,
    /// Render a generated test pattern instead of capturing.
    #[serde(default)]
    pub test_pattern: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioSourceKind {
    Auto,
    Mic,
    Media,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Device indices; -1 = system default.
    #[serde(default = "default_device_index")]
    pub microphone_index: i32,
    #[serde(default = "default_device_index")]
    pub speakers_index: i32,
    #[serde(default = "default_audio_source")]
    pub source: AudioSourceKind,
    #[serde(default = "default_jitter_margin_ms")]
    pub jitter_margin_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    #[serde(default = "default_true")]
    pub encrypt_enabled: bool,
    /// Hard opt-out; wins over encrypt_enabled.
    #[serde(default)]
    pub no_encrypt: bool,
    #[serde(default)]
    pub password: String,
    /// Identity key path, or "gpg:<keyid>".
    #[serde(default)]
    pub encrypt_key: String,
    /// Expected server key fingerprint (out-of-band pin).
    #[serde(default)]
    pub server_key: String,
    #[serde(default = "default_known_hosts_path")]
    pub known_hosts_path: String,
    #[serde(default = "default_client_keys_path")]
    pub client_keys_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Dev,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_file")]
    pub file: String,
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            session_string: String::new(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            server: default_discovery_server(),
            port: default_discovery_port(),
            service_key: String::new(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            turn_servers: Vec::new(),
            turn_username: String::new(),
            turn_credential: String::new(),
            prefer_webrtc: false,
            no_webrtc: false,
            skip_stun: false,
            disable_turn: false,
            ice_timeout_ms: default_ice_timeout_ms(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            fps: 0,
            webcam_index: 0,
            media_path: String::new(),
            test_pattern: false,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            microphone_index: default_device_index(),
            speakers_index: default_device_index(),
            source: default_audio_source(),
            jitter_margin_ms: default_jitter_margin_ms(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            encrypt_enabled: true,
            no_encrypt: false,
            password: String::new(),
            encrypt_key: String::new(),
            server_key: String::new(),
            known_hosts_path: default_known_hosts_path(),
            client_keys_path: default_client_keys_path(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: default_log_file(),
            level: default_log_level(),
        }
    }
}

impl ClientConfig {
    /// Validate the configuration, returning all issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal) or "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.connection.port == 0 {
            issues.push("ERROR: connection.port must be between 1 and 65535, got 0.".to_string());
        }
        if self.connection.reconnect_attempts < -1 {
            issues.push(format!(
                "ERROR: connection.reconnect_attempts must be -1 (unlimited), 0 (never) or positive, got {}.",
                self.connection.reconnect_attempts
            ));
        }
        if !self.connection.session_string.is_empty() {
            let words = self.connection.session_string.split('-').count();
            if words != 3 {
                issues.push(format!(
                    "ERROR: connection.session_string must be three hyphen-separated words, got '{}'.",
                    self.connection.session_string
                ));
            }
        }

        if self.discovery.port == 0 {
            issues.push("ERROR: discovery.port must be between 1 and 65535, got 0.".to_string());
        }

        for url in &self.ice.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{url}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302"
                ));
            }
        }
        for url in &self.ice.turn_servers {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{url}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478"
                ));
            }
        }
        if self.ice.no_webrtc && self.ice.prefer_webrtc {
            issues.push(
                "ERROR: ice.no_webrtc and ice.prefer_webrtc are mutually exclusive.".to_string(),
            );
        }
        if self.ice.no_webrtc && (self.ice.skip_stun || self.ice.disable_turn) {
            issues.push(
                "WARNING: ice.skip_stun / ice.disable_turn have no effect with ice.no_webrtc."
                    .to_string(),
            );
        }

        if self.media.fps > 240 {
            issues.push(format!(
                "ERROR: media.fps must be 0 (probe) or between 1 and 240, got {}.",
                self.media.fps
            ));
        }

        if self.audio.jitter_margin_ms == 0 || self.audio.jitter_margin_ms > 1000 {
            issues.push(format!(
                "ERROR: audio.jitter_margin_ms must be between 1 and 1000, got {}.",
                self.audio.jitter_margin_ms
            ));
        }

        if self.crypto.no_encrypt && !self.crypto.password.is_empty() {
            issues.push(
                "WARNING: crypto.password is set but crypto.no_encrypt disables encryption."
                    .to_string(),
            );
        }
        if !self.crypto.password.is_empty() && self.crypto.password.len() < 8 {
            issues.push(format!(
                "WARNING: crypto.password is only {} characters; 8 or more recommended.",
                self.crypto.password.len()
            ));
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }

    /// Effective encryption switch: `no_encrypt` always wins.
    pub fn encryption_enabled(&self) -> bool {
        self.crypto.encrypt_enabled && !self.crypto.no_encrypt
    }
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    27224
}
fn default_reconnect_attempts() -> i32 {
    3
}
fn default_reconnect_delay_ms() -> u32 {
    2000
}
fn default_discovery_server() -> String {
    "acds.glyphchat.net".to_string()
}
fn default_discovery_port() -> u16 {
    27225
}
fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
fn default_ice_timeout_ms() -> u32 {
    8000
}
fn default_true() -> bool {
    true
}
fn default_device_index() -> i32 {
    -1
}
fn default_audio_source() -> AudioSourceKind {
    AudioSourceKind::Auto
}
fn default_jitter_margin_ms() -> u32 {
    100
}
fn default_known_hosts_path() -> String {
    "~/.config/glyphchat/known_hosts".to_string()
}
fn default_client_keys_path() -> String {
    "~/.config/glyphchat/client_keys".to_string()
}
fn default_log_file() -> String {
    String::new()
}
fn default_log_level() -> LogLevel {
    LogLevel::Info
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ClientConfig {
        toml::from_str("").expect("default config")
    }

    fn validate_issues(config: &ClientConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => vec![],
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    #[test]
    fn default_config_from_empty_string() {
        let config: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(config.connection.address, "127.0.0.1");
        assert_eq!(config.connection.port, 27224);
        assert_eq!(config.connection.reconnect_attempts, 3);
        assert_eq!(config.connection.reconnect_delay_ms, 2000);
        assert_eq!(config.discovery.port, 27225);
        assert_eq!(config.ice.stun_servers.len(), 2);
        assert!(config.ice.turn_servers.is_empty());
        assert!(!config.ice.prefer_webrtc);
        assert!(!config.ice.no_webrtc);
        assert_eq!(config.ice.ice_timeout_ms, 8000);
        assert_eq!(config.media.fps, 0);
        assert!(config.audio.enabled);
        assert_eq!(config.audio.microphone_index, -1);
        assert_eq!(config.audio.source, AudioSourceKind::Auto);
        assert_eq!(config.audio.jitter_margin_ms, 100);
        assert!(config.crypto.encrypt_enabled);
        assert!(!config.crypto.no_encrypt);
        assert_eq!(config.log.level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_config_overrides_one_section() {
        let config: ClientConfig = toml::from_str(
            r#"
[connection]
address = "chat.example.net"
port = 9000
"#,
        )
        .unwrap();
        assert_eq!(config.connection.address, "chat.example.net");
        assert_eq!(config.connection.port, 9000);
        // Untouched sections keep defaults
        assert_eq!(config.discovery.port, 27225);
        assert!(config.audio.enabled);
    }

    #[test]
    fn encryption_enabled_respects_no_encrypt() {
        let mut config = valid_config();
        assert!(config.encryption_enabled());
        config.crypto.no_encrypt = true;
        assert!(!config.encryption_enabled());
        config.crypto.no_encrypt = false;
        config.crypto.encrypt_enabled = false;
        assert!(!config.encryption_enabled());
    }

    #[test]
    fn validate_port_zero_is_error() {
        let mut config = valid_config();
        config.connection.port = 0;
        assert!(has_error(&validate_issues(&config), "connection.port"));
    }

    #[test]
    fn validate_session_string_shape() {
        let mut config = valid_config();
        config.connection.session_string = "happy-sunset-ocean".into();
        assert!(config.validate().is_ok());
        config.connection.session_string = "justoneword".into();
        assert!(has_error(&validate_issues(&config), "session_string"));
    }

    #[test]
    fn validate_reconnect_attempts_range() {
        let mut config = valid_config();
        config.connection.reconnect_attempts = -1;
        assert!(config.validate().is_ok());
        config.connection.reconnect_attempts = -2;
        assert!(has_error(&validate_issues(&config), "reconnect_attempts"));
    }

    #[test]
    fn validate_stun_turn_url_prefixes() {
        let mut config = valid_config();
        config.ice.stun_servers = vec!["http://stun.example.com".into()];
        assert!(has_error(&validate_issues(&config), "STUN URL"));

        let mut config = valid_config();
        config.ice.turn_servers = vec!["stun:wrong.example.com".into()];
        assert!(has_error(&validate_issues(&config), "TURN URL"));

        let mut config = valid_config();
        config.ice.turn_servers = vec!["turns:turn.example.com:5349".into()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_webrtc_flag_conflicts() {
        let mut config = valid_config();
        config.ice.no_webrtc = true;
        config.ice.prefer_webrtc = true;
        assert!(has_error(&validate_issues(&config), "mutually exclusive"));
    }

    #[test]
    fn validate_jitter_margin_bounds() {
        let mut config = valid_config();
        config.audio.jitter_margin_ms = 0;
        assert!(has_error(&validate_issues(&config), "jitter_margin_ms"));
        config.audio.jitter_margin_ms = 1001;
        assert!(has_error(&validate_issues(&config), "jitter_margin_ms"));
        config.audio.jitter_margin_ms = 100;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn log_level_parses_lowercase() {
        let config: ClientConfig = toml::from_str("[log]\nlevel = \"debug\"\n").unwrap();
        assert_eq!(config.log.level, LogLevel::Debug);
        let config: ClientConfig = toml::from_str("[log]\nlevel = \"fatal\"\n").unwrap();
        assert_eq!(config.log.level, LogLevel::Fatal);
    }

    #[test]
    fn log_levels_are_ordered() {
        assert!(LogLevel::Dev < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Fatal);
    }
}
