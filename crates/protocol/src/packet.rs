//! Typed packet codec.
//!
//! Every on-the-wire packet kind has one [`Packet`] variant with a
//! serializer and a bounds-checked deserializer. All multi-byte integers
//! are big-endian; strings are `u16` length-prefixed UTF-8 (SDP bodies use
//! a `u32` prefix). Unknown types surface as [`CodecError::UnknownType`] so
//! the dispatcher can decide between log-and-drop and handshake failure.
//!
//! The encrypted envelope deserializes to [`Packet::Encrypted`] without
//! touching its plaintext; the receive path decrypts and re-enters
//! [`Packet::decode`] on the inner frame.

use uuid::Uuid;

use crate::error::CodecError;
use crate::wire::{self, MAX_PACKET_SIZE};

/// Wire packet type identifiers, grouped by family.
pub mod kind {
    // Control: 0x0001..=0x000f
    pub const PING: u16 = 0x0001;
    pub const PONG: u16 = 0x0002;
    pub const CLIENT_JOIN: u16 = 0x0003;
    pub const TERMINAL_SIZE: u16 = 0x0004;
    pub const SERVER_STATE: u16 = 0x0005;
    pub const STREAM_START: u16 = 0x0006;
    pub const STREAM_STOP: u16 = 0x0007;
    pub const CLEAR_CONSOLE: u16 = 0x0008;

    // Media: 0x0010..=0x001f
    pub const VIDEO_FRAME: u16 = 0x0010;
    pub const AUDIO_OPUS: u16 = 0x0011;

    // Crypto: 0x0020..=0x002f
    pub const PROTOCOL_VERSION: u16 = 0x0020;
    pub const CRYPTO_CAPABILITIES: u16 = 0x0021;
    pub const CRYPTO_PARAMETERS: u16 = 0x0022;
    pub const KEY_EXCHANGE_INIT: u16 = 0x0023;
    pub const KEY_EXCHANGE_RESP: u16 = 0x0024;
    pub const AUTH_CHALLENGE: u16 = 0x0025;
    pub const AUTH_RESPONSE: u16 = 0x0026;
    pub const AUTH_SUCCESS: u16 = 0x0027;
    pub const AUTH_FAILED: u16 = 0x0028;
    pub const NO_ENCRYPTION: u16 = 0x0029;
    pub const REKEY_REQUEST: u16 = 0x002a;
    pub const REKEY_RESPONSE: u16 = 0x002b;
    pub const REKEY_COMPLETE: u16 = 0x002c;

    // Envelope
    pub const ENCRYPTED: u16 = 0x0030;

    // Signalling: 0x0040..=0x004f
    pub const SESSION_LOOKUP: u16 = 0x0040;
    pub const SESSION_JOIN: u16 = 0x0041;
    pub const SESSION_INFO: u16 = 0x0042;
    pub const SESSION_JOINED: u16 = 0x0043;
    pub const SESSION_ERROR: u16 = 0x0044;
    pub const WEBRTC_SDP: u16 = 0x0045;
    pub const WEBRTC_ICE: u16 = 0x0046;
}

pub const PROTOCOL_VERSION_MAJOR: u16 = 1;
pub const PROTOCOL_VERSION_MINOR: u16 = 0;

// ClientJoin capability bits.
pub const CAP_VIDEO: u32 = 0x01;
pub const CAP_AUDIO: u32 = 0x02;

// AuthChallenge requirement bits.
pub const AUTH_REQUIRE_PASSWORD: u8 = 0x01;
pub const AUTH_REQUIRE_CLIENT_KEY: u8 = 0x02;

// Video frame flag bits; pixel format lives in bits 8..11.
pub const FRAME_FLAG_HAS_COLOR: u32 = 0x01;
pub const FRAME_FLAG_IS_COMPRESSED: u32 = 0x02;
pub const FRAME_FLAG_RLE_COMPRESSED: u32 = 0x04;
pub const FRAME_FLAG_IS_STRETCHED: u32 = 0x08;

// Crypto algorithm bitmaps / identifiers. One algorithm per slot today;
// the bitmaps exist so peers can add alternatives without a version bump.
pub const KEX_X25519: u16 = 0x0001;
pub const AUTH_ED25519: u16 = 0x0001;
pub const CIPHER_XSALSA20_POLY1305: u16 = 0x0001;

pub const X25519_PUBLIC_LEN: usize = 32;
pub const ED25519_PUBLIC_LEN: usize = 32;
pub const ED25519_SIGNATURE_LEN: usize = 64;
pub const ENVELOPE_NONCE_LEN: usize = 24;
pub const AUTH_NONCE_LEN: usize = 32;
pub const HMAC_LEN: usize = 32;

pub const MAX_DISPLAY_NAME: usize = 32;
pub const MAX_SESSION_STRING: usize = 128;
pub const MAX_ADDRESS: usize = 256;
pub const MAX_REASON: usize = 512;
pub const MAX_SDP: usize = 64 * 1024;
pub const MAX_ICE_CANDIDATE: usize = 1024;
pub const MAX_VIDEO_DIM: u32 = 4096;
pub const MAX_OPUS_FRAMES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb = 0,
    Rgba = 1,
    Bgr = 2,
    Bgra = 3,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb | PixelFormat::Bgr => 3,
            PixelFormat::Rgba | PixelFormat::Bgra => 4,
        }
    }

    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(PixelFormat::Rgb),
            1 => Some(PixelFormat::Rgba),
            2 => Some(PixelFormat::Bgr),
            3 => Some(PixelFormat::Bgra),
            _ => None,
        }
    }
}

/// Extract the pixel format from a video frame flags word.
pub fn frame_pixel_format(flags: u32) -> Option<PixelFormat> {
    PixelFormat::from_u32((flags >> 8) & 0x0f)
}

/// Build a flags word from flag bits and a pixel format.
pub fn frame_flags(bits: u32, format: PixelFormat) -> u32 {
    (bits & 0xff) | ((format as u32) << 8)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video = 0,
    Audio = 1,
}

impl StreamKind {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(StreamKind::Video),
            1 => Some(StreamKind::Audio),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer = 0,
    Answer = 1,
}

/// Argon2id parameters negotiated for password-derived keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Params {
    pub t_cost: u32,
    pub m_cost: u32,
    pub parallelism: u8,
    pub salt_len: u16,
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self {
            t_cost: 3,
            m_cost: 64 * 1024,
            parallelism: 1,
            salt_len: 16,
        }
    }
}

/// Identity key + signature trailer carried by the key-exchange packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityProof {
    pub public_key: [u8; ED25519_PUBLIC_LEN],
    pub signature: [u8; ED25519_SIGNATURE_LEN],
}

/// TURN relay credentials handed out by the discovery service on join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCredentials {
    pub username: String,
    pub password: String,
    pub ttl_secs: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    // Control
    Ping,
    Pong,
    ClientJoin {
        display_name: String,
        capabilities: u32,
    },
    TerminalSize {
        width: u16,
        height: u16,
        flags: u32,
    },
    ServerState {
        active_clients: u32,
    },
    StreamStart(StreamKind),
    StreamStop(StreamKind),
    ClearConsole,

    // Media
    VideoFrame {
        width: u32,
        height: u32,
        flags: u32,
        pixels: Vec<u8>,
    },
    AudioOpus {
        sample_rate: u32,
        frame_ms: u16,
        frames: Vec<Vec<u8>>,
    },

    // Crypto
    ProtocolVersion {
        version: u16,
        revision: u16,
        supports_encryption: bool,
        compression: u16,
        compression_threshold: u32,
        features: u32,
    },
    NoEncryption,
    CryptoCapabilities {
        kex_bitmap: u16,
        auth_bitmap: u16,
        cipher_bitmap: u16,
        requires_verification: bool,
        preferred_kex: u8,
        preferred_auth: u8,
        preferred_cipher: u8,
    },
    CryptoParameters {
        kex: u8,
        auth: u8,
        cipher: u8,
        kex_pubkey_size: u16,
        signature_size: u16,
        argon2: Argon2Params,
    },
    KeyExchangeInit {
        ephemeral: [u8; X25519_PUBLIC_LEN],
        identity: Option<IdentityProof>,
    },
    KeyExchangeResp {
        ephemeral: [u8; X25519_PUBLIC_LEN],
        identity: Option<IdentityProof>,
        /// Mutual-auth nonce: the responder proves knowledge of the session
        /// key by returning HMAC(session_key, nonce) in AuthSuccess.
        client_nonce: Option<[u8; AUTH_NONCE_LEN]>,
    },
    AuthChallenge {
        requirements: u8,
        nonce: [u8; AUTH_NONCE_LEN],
    },
    AuthResponse {
        /// HMAC over the challenge; zero-filled when password auth is not
        /// in use (the requirement bitmap decides which fields count).
        hmac: [u8; HMAC_LEN],
        identity_pubkey: Vec<u8>,
        signature: Vec<u8>,
    },
    AuthSuccess {
        server_hmac: [u8; HMAC_LEN],
    },
    AuthFailed {
        reason: String,
    },
    RekeyRequest {
        ephemeral: [u8; X25519_PUBLIC_LEN],
    },
    RekeyResponse {
        ephemeral: [u8; X25519_PUBLIC_LEN],
    },
    RekeyComplete,

    // Envelope
    Encrypted {
        nonce: [u8; ENVELOPE_NONCE_LEN],
        ciphertext: Vec<u8>,
    },

    // Signalling
    SessionLookup {
        session_string: String,
    },
    SessionJoin {
        session_string: String,
        password: Option<String>,
    },
    SessionInfo {
        session_id: Uuid,
        session_string: String,
        participant_count: u32,
    },
    SessionJoined {
        session_id: Uuid,
        participant_id: Uuid,
        server_address: String,
        server_port: u16,
        turn: Option<TurnCredentials>,
    },
    SessionError {
        code: u16,
        message: String,
    },
    WebRtcSdp {
        session_id: Uuid,
        recipient_id: Uuid,
        sdp_kind: SdpKind,
        sdp: String,
    },
    WebRtcIce {
        session_id: Uuid,
        recipient_id: Uuid,
        candidate: String,
        sdp_mid: String,
        sdp_mline_index: u16,
    },
}

impl Packet {
    pub fn kind(&self) -> u16 {
        match self {
            Packet::Ping => kind::PING,
            Packet::Pong => kind::PONG,
            Packet::ClientJoin { .. } => kind::CLIENT_JOIN,
            Packet::TerminalSize { .. } => kind::TERMINAL_SIZE,
            Packet::ServerState { .. } => kind::SERVER_STATE,
            Packet::StreamStart(_) => kind::STREAM_START,
            Packet::StreamStop(_) => kind::STREAM_STOP,
            Packet::ClearConsole => kind::CLEAR_CONSOLE,
            Packet::VideoFrame { .. } => kind::VIDEO_FRAME,
            Packet::AudioOpus { .. } => kind::AUDIO_OPUS,
            Packet::ProtocolVersion { .. } => kind::PROTOCOL_VERSION,
            Packet::NoEncryption => kind::NO_ENCRYPTION,
            Packet::CryptoCapabilities { .. } => kind::CRYPTO_CAPABILITIES,
            Packet::CryptoParameters { .. } => kind::CRYPTO_PARAMETERS,
            Packet::KeyExchangeInit { .. } => kind::KEY_EXCHANGE_INIT,
            Packet::KeyExchangeResp { .. } => kind::KEY_EXCHANGE_RESP,
            Packet::AuthChallenge { .. } => kind::AUTH_CHALLENGE,
            Packet::AuthResponse { .. } => kind::AUTH_RESPONSE,
            Packet::AuthSuccess { .. } => kind::AUTH_SUCCESS,
            Packet::AuthFailed { .. } => kind::AUTH_FAILED,
            Packet::RekeyRequest { .. } => kind::REKEY_REQUEST,
            Packet::RekeyResponse { .. } => kind::REKEY_RESPONSE,
            Packet::RekeyComplete => kind::REKEY_COMPLETE,
            Packet::Encrypted { .. } => kind::ENCRYPTED,
            Packet::SessionLookup { .. } => kind::SESSION_LOOKUP,
            Packet::SessionJoin { .. } => kind::SESSION_JOIN,
            Packet::SessionInfo { .. } => kind::SESSION_INFO,
            Packet::SessionJoined { .. } => kind::SESSION_JOINED,
            Packet::SessionError { .. } => kind::SESSION_ERROR,
            Packet::WebRtcSdp { .. } => kind::WEBRTC_SDP,
            Packet::WebRtcIce { .. } => kind::WEBRTC_ICE,
        }
    }

    pub fn kind_name(kind: u16) -> &'static str {
        match kind {
            kind::PING => "Ping",
            kind::PONG => "Pong",
            kind::CLIENT_JOIN => "ClientJoin",
            kind::TERMINAL_SIZE => "TerminalSize",
            kind::SERVER_STATE => "ServerState",
            kind::STREAM_START => "StreamStart",
            kind::STREAM_STOP => "StreamStop",
            kind::CLEAR_CONSOLE => "ClearConsole",
            kind::VIDEO_FRAME => "VideoFrame",
            kind::AUDIO_OPUS => "AudioOpus",
            kind::PROTOCOL_VERSION => "ProtocolVersion",
            kind::NO_ENCRYPTION => "NoEncryption",
            kind::CRYPTO_CAPABILITIES => "CryptoCapabilities",
            kind::CRYPTO_PARAMETERS => "CryptoParameters",
            kind::KEY_EXCHANGE_INIT => "KeyExchangeInit",
            kind::KEY_EXCHANGE_RESP => "KeyExchangeResp",
            kind::AUTH_CHALLENGE => "AuthChallenge",
            kind::AUTH_RESPONSE => "AuthResponse",
            kind::AUTH_SUCCESS => "AuthSuccess",
            kind::AUTH_FAILED => "AuthFailed",
            kind::REKEY_REQUEST => "RekeyRequest",
            kind::REKEY_RESPONSE => "RekeyResponse",
            kind::REKEY_COMPLETE => "RekeyComplete",
            kind::ENCRYPTED => "Encrypted",
            kind::SESSION_LOOKUP => "SessionLookup",
            kind::SESSION_JOIN => "SessionJoin",
            kind::SESSION_INFO => "SessionInfo",
            kind::SESSION_JOINED => "SessionJoined",
            kind::SESSION_ERROR => "SessionError",
            kind::WEBRTC_SDP => "WebRtcSdp",
            kind::WEBRTC_ICE => "WebRtcIce",
            _ => "Unknown",
        }
    }

    /// Packet kinds that are never wrapped in an encrypted envelope: the
    /// handshake itself plus the envelope type. Everything else is sealed
    /// once a session key is installed.
    pub fn is_cleartext_kind(kind: u16) -> bool {
        matches!(
            kind,
            kind::PROTOCOL_VERSION
                | kind::NO_ENCRYPTION
                | kind::CRYPTO_CAPABILITIES
                | kind::CRYPTO_PARAMETERS
                | kind::KEY_EXCHANGE_INIT
                | kind::KEY_EXCHANGE_RESP
                | kind::AUTH_CHALLENGE
                | kind::AUTH_RESPONSE
                | kind::AUTH_SUCCESS
                | kind::AUTH_FAILED
                | kind::ENCRYPTED
        )
    }

    /// Serialize the payload (header excluded).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Packet::Ping | Packet::Pong | Packet::ClearConsole | Packet::NoEncryption
            | Packet::RekeyComplete => {}
            Packet::ClientJoin {
                display_name,
                capabilities,
            } => {
                w.str16(display_name);
                w.u32(*capabilities);
            }
            Packet::TerminalSize {
                width,
                height,
                flags,
            } => {
                w.u16(*width);
                w.u16(*height);
                w.u32(*flags);
            }
            Packet::ServerState { active_clients } => w.u32(*active_clients),
            Packet::StreamStart(s) | Packet::StreamStop(s) => w.u32(*s as u32),
            Packet::VideoFrame {
                width,
                height,
                flags,
                pixels,
            } => {
                w.u32(*width);
                w.u32(*height);
                w.u32(*flags);
                w.u32(pixels.len() as u32);
                w.bytes(pixels);
            }
            Packet::AudioOpus {
                sample_rate,
                frame_ms,
                frames,
            } => {
                w.u32(*sample_rate);
                w.u16(*frame_ms);
                w.u16(frames.len() as u16);
                for f in frames {
                    w.u16(f.len() as u16);
                }
                for f in frames {
                    w.bytes(f);
                }
            }
            Packet::ProtocolVersion {
                version,
                revision,
                supports_encryption,
                compression,
                compression_threshold,
                features,
            } => {
                w.u16(*version);
                w.u16(*revision);
                w.u8(*supports_encryption as u8);
                w.u16(*compression);
                w.u32(*compression_threshold);
                w.u32(*features);
            }
            Packet::CryptoCapabilities {
                kex_bitmap,
                auth_bitmap,
                cipher_bitmap,
                requires_verification,
                preferred_kex,
                preferred_auth,
                preferred_cipher,
            } => {
                w.u16(*kex_bitmap);
                w.u16(*auth_bitmap);
                w.u16(*cipher_bitmap);
                w.u8(*requires_verification as u8);
                w.u8(*preferred_kex);
                w.u8(*preferred_auth);
                w.u8(*preferred_cipher);
            }
            Packet::CryptoParameters {
                kex,
                auth,
                cipher,
                kex_pubkey_size,
                signature_size,
                argon2,
            } => {
                w.u8(*kex);
                w.u8(*auth);
                w.u8(*cipher);
                w.u16(*kex_pubkey_size);
                w.u16(*signature_size);
                w.u32(argon2.t_cost);
                w.u32(argon2.m_cost);
                w.u8(argon2.parallelism);
                w.u16(argon2.salt_len);
            }
            Packet::KeyExchangeInit {
                ephemeral,
                identity,
            } => {
                w.bytes(ephemeral);
                if let Some(proof) = identity {
                    w.bytes(&proof.public_key);
                    w.bytes(&proof.signature);
                }
            }
            Packet::KeyExchangeResp {
                ephemeral,
                identity,
                client_nonce,
            } => {
                w.bytes(ephemeral);
                if let Some(proof) = identity {
                    w.bytes(&proof.public_key);
                    w.bytes(&proof.signature);
                }
                if let Some(nonce) = client_nonce {
                    w.bytes(nonce);
                }
            }
            Packet::AuthChallenge {
                requirements,
                nonce,
            } => {
                w.u8(*requirements);
                w.bytes(nonce);
            }
            Packet::AuthResponse {
                hmac,
                identity_pubkey,
                signature,
            } => {
                w.bytes(hmac);
                w.u16(identity_pubkey.len() as u16);
                w.bytes(identity_pubkey);
                w.u16(signature.len() as u16);
                w.bytes(signature);
            }
            Packet::AuthSuccess { server_hmac } => w.bytes(server_hmac),
            Packet::AuthFailed { reason } => w.str16(reason),
            Packet::RekeyRequest { ephemeral } | Packet::RekeyResponse { ephemeral } => {
                w.bytes(ephemeral)
            }
            Packet::Encrypted { nonce, ciphertext } => {
                w.bytes(nonce);
                w.bytes(ciphertext);
            }
            Packet::SessionLookup { session_string } => w.str16(session_string),
            Packet::SessionJoin {
                session_string,
                password,
            } => {
                w.str16(session_string);
                w.u8(password.is_some() as u8);
                if let Some(pw) = password {
                    w.str16(pw);
                }
            }
            Packet::SessionInfo {
                session_id,
                session_string,
                participant_count,
            } => {
                w.bytes(session_id.as_bytes());
                w.str16(session_string);
                w.u32(*participant_count);
            }
            Packet::SessionJoined {
                session_id,
                participant_id,
                server_address,
                server_port,
                turn,
            } => {
                w.bytes(session_id.as_bytes());
                w.bytes(participant_id.as_bytes());
                w.str16(server_address);
                w.u16(*server_port);
                w.u8(turn.is_some() as u8);
                if let Some(t) = turn {
                    w.str16(&t.username);
                    w.str16(&t.password);
                    w.u32(t.ttl_secs);
                }
            }
            Packet::SessionError { code, message } => {
                w.u16(*code);
                w.str16(message);
            }
            Packet::WebRtcSdp {
                session_id,
                recipient_id,
                sdp_kind,
                sdp,
            } => {
                w.bytes(session_id.as_bytes());
                w.bytes(recipient_id.as_bytes());
                w.u8(*sdp_kind as u8);
                w.u32(sdp.len() as u32);
                w.bytes(sdp.as_bytes());
            }
            Packet::WebRtcIce {
                session_id,
                recipient_id,
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                w.bytes(session_id.as_bytes());
                w.bytes(recipient_id.as_bytes());
                w.str16(candidate);
                w.str16(sdp_mid);
                w.u16(*sdp_mline_index);
            }
        }
        w.buf
    }

    /// Serialize a full frame (header + payload) ready for a transport.
    pub fn to_frame(&self) -> Vec<u8> {
        wire::frame_packet(self.kind(), &self.encode_payload())
    }

    /// Decode a payload for a given wire type.
    pub fn decode(packet_kind: u16, payload: &[u8]) -> Result<Packet, CodecError> {
        let name = Packet::kind_name(packet_kind);
        let mut r = Reader::new(name, payload);
        let packet = match packet_kind {
            kind::PING => Packet::Ping,
            kind::PONG => Packet::Pong,
            kind::CLEAR_CONSOLE => Packet::ClearConsole,
            kind::NO_ENCRYPTION => Packet::NoEncryption,
            kind::REKEY_COMPLETE => Packet::RekeyComplete,
            kind::CLIENT_JOIN => {
                let display_name = r.str16("display_name", MAX_DISPLAY_NAME)?;
                let capabilities = r.u32()?;
                Packet::ClientJoin {
                    display_name,
                    capabilities,
                }
            }
            kind::TERMINAL_SIZE => Packet::TerminalSize {
                width: r.u16()?,
                height: r.u16()?,
                flags: r.u32()?,
            },
            kind::SERVER_STATE => Packet::ServerState {
                active_clients: r.u32()?,
            },
            kind::STREAM_START | kind::STREAM_STOP => {
                let raw = r.u32()?;
                let stream = StreamKind::from_u32(raw).ok_or_else(|| CodecError::InvalidField {
                    kind: name,
                    field: "stream_type",
                    reason: format!("unknown value {raw}"),
                })?;
                if packet_kind == kind::STREAM_START {
                    Packet::StreamStart(stream)
                } else {
                    Packet::StreamStop(stream)
                }
            }
            kind::VIDEO_FRAME => {
                let width = r.u32()?;
                let height = r.u32()?;
                let flags = r.u32()?;
                let data_size = r.u32()? as usize;
                if width == 0 || width > MAX_VIDEO_DIM || height == 0 || height > MAX_VIDEO_DIM {
                    return Err(CodecError::InvalidField {
                        kind: name,
                        field: "dimensions",
                        reason: format!("{width}x{height} outside 1..={MAX_VIDEO_DIM}"),
                    });
                }
                if data_size > MAX_PACKET_SIZE - 16 {
                    return Err(CodecError::InvalidField {
                        kind: name,
                        field: "data_size",
                        reason: format!("{data_size} exceeds packet bound"),
                    });
                }
                let pixels = r.take("pixels", data_size)?.to_vec();
                // Uncompressed frames must match their declared geometry.
                if flags & (FRAME_FLAG_IS_COMPRESSED | FRAME_FLAG_RLE_COMPRESSED) == 0 {
                    let format =
                        frame_pixel_format(flags).ok_or_else(|| CodecError::InvalidField {
                            kind: name,
                            field: "flags",
                            reason: format!("bad pixel format in 0x{flags:08x}"),
                        })?;
                    let expected = width as usize * height as usize * format.bytes_per_pixel();
                    if pixels.len() != expected {
                        return Err(CodecError::InvalidField {
                            kind: name,
                            field: "data_size",
                            reason: format!(
                                "{} bytes for {width}x{height} {format:?} (expected {expected})",
                                pixels.len()
                            ),
                        });
                    }
                }
                Packet::VideoFrame {
                    width,
                    height,
                    flags,
                    pixels,
                }
            }
            kind::AUDIO_OPUS => {
                let sample_rate = r.u32()?;
                if !matches!(sample_rate, 8000 | 12000 | 16000 | 24000 | 48000) {
                    return Err(CodecError::InvalidField {
                        kind: name,
                        field: "sample_rate",
                        reason: format!("{sample_rate} is not an Opus rate"),
                    });
                }
                let frame_ms = r.u16()?;
                if !matches!(frame_ms, 10 | 20 | 40 | 60) {
                    return Err(CodecError::InvalidField {
                        kind: name,
                        field: "frame_ms",
                        reason: format!("{frame_ms} ms is not a supported frame duration"),
                    });
                }
                let frame_count = r.u16()? as usize;
                if frame_count == 0 || frame_count > MAX_OPUS_FRAMES {
                    return Err(CodecError::InvalidField {
                        kind: name,
                        field: "frame_count",
                        reason: format!("{frame_count} outside 1..={MAX_OPUS_FRAMES}"),
                    });
                }
                let mut sizes = Vec::with_capacity(frame_count);
                for _ in 0..frame_count {
                    sizes.push(r.u16()? as usize);
                }
                let mut frames = Vec::with_capacity(frame_count);
                for size in sizes {
                    frames.push(r.take("opus_data", size)?.to_vec());
                }
                Packet::AudioOpus {
                    sample_rate,
                    frame_ms,
                    frames,
                }
            }
            kind::PROTOCOL_VERSION => Packet::ProtocolVersion {
                version: r.u16()?,
                revision: r.u16()?,
                supports_encryption: r.u8()? != 0,
                compression: r.u16()?,
                compression_threshold: r.u32()?,
                features: r.u32()?,
            },
            kind::CRYPTO_CAPABILITIES => Packet::CryptoCapabilities {
                kex_bitmap: r.u16()?,
                auth_bitmap: r.u16()?,
                cipher_bitmap: r.u16()?,
                requires_verification: r.u8()? != 0,
                preferred_kex: r.u8()?,
                preferred_auth: r.u8()?,
                preferred_cipher: r.u8()?,
            },
            kind::CRYPTO_PARAMETERS => Packet::CryptoParameters {
                kex: r.u8()?,
                auth: r.u8()?,
                cipher: r.u8()?,
                kex_pubkey_size: r.u16()?,
                signature_size: r.u16()?,
                argon2: Argon2Params {
                    t_cost: r.u32()?,
                    m_cost: r.u32()?,
                    parallelism: r.u8()?,
                    salt_len: r.u16()?,
                },
            },
            kind::KEY_EXCHANGE_INIT => {
                let ephemeral = r.array::<X25519_PUBLIC_LEN>("ephemeral_pubkey")?;
                let identity = r.optional_identity()?;
                Packet::KeyExchangeInit {
                    ephemeral,
                    identity,
                }
            }
            kind::KEY_EXCHANGE_RESP => {
                let ephemeral = r.array::<X25519_PUBLIC_LEN>("ephemeral_pubkey")?;
                let identity = match r.remaining() {
                    n if n >= ED25519_PUBLIC_LEN + ED25519_SIGNATURE_LEN => r.optional_identity()?,
                    _ => None,
                };
                let client_nonce = match r.remaining() {
                    0 => None,
                    AUTH_NONCE_LEN => Some(r.array::<AUTH_NONCE_LEN>("client_nonce")?),
                    n => {
                        return Err(CodecError::InvalidField {
                            kind: name,
                            field: "client_nonce",
                            reason: format!("{n} trailing bytes is not a nonce"),
                        });
                    }
                };
                Packet::KeyExchangeResp {
                    ephemeral,
                    identity,
                    client_nonce,
                }
            }
            kind::AUTH_CHALLENGE => Packet::AuthChallenge {
                requirements: r.u8()?,
                nonce: r.array::<AUTH_NONCE_LEN>("nonce")?,
            },
            kind::AUTH_RESPONSE => {
                let hmac = r.array::<HMAC_LEN>("hmac")?;
                let identity_pubkey = r.bytes16("identity_pubkey", ED25519_PUBLIC_LEN)?;
                let signature = r.bytes16("signature", ED25519_SIGNATURE_LEN)?;
                Packet::AuthResponse {
                    hmac,
                    identity_pubkey,
                    signature,
                }
            }
            kind::AUTH_SUCCESS => Packet::AuthSuccess {
                server_hmac: r.array::<HMAC_LEN>("server_hmac")?,
            },
            kind::AUTH_FAILED => Packet::AuthFailed {
                reason: r.str16("reason", MAX_REASON)?,
            },
            kind::REKEY_REQUEST => Packet::RekeyRequest {
                ephemeral: r.array::<X25519_PUBLIC_LEN>("ephemeral_pubkey")?,
            },
            kind::REKEY_RESPONSE => Packet::RekeyResponse {
                ephemeral: r.array::<X25519_PUBLIC_LEN>("ephemeral_pubkey")?,
            },
            kind::ENCRYPTED => {
                let nonce = r.array::<ENVELOPE_NONCE_LEN>("nonce")?;
                let ciphertext = r.rest().to_vec();
                Packet::Encrypted { nonce, ciphertext }
            }
            kind::SESSION_LOOKUP => Packet::SessionLookup {
                session_string: r.str16("session_string", MAX_SESSION_STRING)?,
            },
            kind::SESSION_JOIN => {
                let session_string = r.str16("session_string", MAX_SESSION_STRING)?;
                let password = if r.u8()? != 0 {
                    Some(r.str16("password", MAX_ADDRESS)?)
                } else {
                    None
                };
                Packet::SessionJoin {
                    session_string,
                    password,
                }
            }
            kind::SESSION_INFO => Packet::SessionInfo {
                session_id: r.uuid("session_id")?,
                session_string: r.str16("session_string", MAX_SESSION_STRING)?,
                participant_count: r.u32()?,
            },
            kind::SESSION_JOINED => {
                let session_id = r.uuid("session_id")?;
                let participant_id = r.uuid("participant_id")?;
                let server_address = r.str16("server_address", MAX_ADDRESS)?;
                let server_port = r.u16()?;
                let turn = if r.u8()? != 0 {
                    Some(TurnCredentials {
                        username: r.str16("turn_username", MAX_SESSION_STRING)?,
                        password: r.str16("turn_password", MAX_ADDRESS)?,
                        ttl_secs: r.u32()?,
                    })
                } else {
                    None
                };
                Packet::SessionJoined {
                    session_id,
                    participant_id,
                    server_address,
                    server_port,
                    turn,
                }
            }
            kind::SESSION_ERROR => Packet::SessionError {
                code: r.u16()?,
                message: r.str16("message", MAX_REASON)?,
            },
            kind::WEBRTC_SDP => {
                let session_id = r.uuid("session_id")?;
                let recipient_id = r.uuid("recipient_id")?;
                let sdp_kind = match r.u8()? {
                    0 => SdpKind::Offer,
                    1 => SdpKind::Answer,
                    other => {
                        return Err(CodecError::InvalidField {
                            kind: name,
                            field: "sdp_type",
                            reason: format!("unknown value {other}"),
                        });
                    }
                };
                let sdp_len = r.u32()? as usize;
                if sdp_len > MAX_SDP {
                    return Err(CodecError::InvalidField {
                        kind: name,
                        field: "sdp_len",
                        reason: format!("{sdp_len} exceeds {MAX_SDP}"),
                    });
                }
                let sdp = String::from_utf8(r.take("sdp", sdp_len)?.to_vec())
                    .map_err(|_| CodecError::BadUtf8 {
                        kind: name,
                        field: "sdp",
                    })?;
                Packet::WebRtcSdp {
                    session_id,
                    recipient_id,
                    sdp_kind,
                    sdp,
                }
            }
            kind::WEBRTC_ICE => Packet::WebRtcIce {
                session_id: r.uuid("session_id")?,
                recipient_id: r.uuid("recipient_id")?,
                candidate: r.str16("candidate", MAX_ICE_CANDIDATE)?,
                sdp_mid: r.str16("sdp_mid", 64)?,
                sdp_mline_index: r.u16()?,
            },
            other => return Err(CodecError::UnknownType(other)),
        };
        r.finish()?;
        Ok(packet)
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
    fn str16(&mut self, v: &str) {
        self.u16(v.len() as u16);
        self.bytes(v.as_bytes());
    }
}

struct Reader<'a> {
    kind: &'static str,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(kind: &'static str, buf: &'a [u8]) -> Self {
        Self { kind, buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, _field: &'static str, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::ShortPayload {
                kind: self.kind,
                expected: self.pos + n,
                got: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take("u8", 1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take("u16", 2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take("u32", 4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], CodecError> {
        let b = self.take(field, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(b);
        Ok(out)
    }

    fn uuid(&mut self, field: &'static str) -> Result<Uuid, CodecError> {
        Ok(Uuid::from_bytes(self.array::<16>(field)?))
    }

    /// Length-prefixed byte field with an upper bound (0 length = absent).
    fn bytes16(&mut self, field: &'static str, max: usize) -> Result<Vec<u8>, CodecError> {
        let len = self.u16()? as usize;
        if len > max {
            return Err(CodecError::InvalidField {
                kind: self.kind,
                field,
                reason: format!("length {len} exceeds bound {max}"),
            });
        }
        Ok(self.take(field, len)?.to_vec())
    }

    fn str16(&mut self, field: &'static str, max: usize) -> Result<String, CodecError> {
        let raw = self.bytes16(field, max)?;
        String::from_utf8(raw).map_err(|_| CodecError::BadUtf8 {
            kind: self.kind,
            field,
        })
    }

    fn optional_identity(&mut self) -> Result<Option<IdentityProof>, CodecError> {
        if self.remaining() == 0 {
            return Ok(None);
        }
        Ok(Some(IdentityProof {
            public_key: self.array::<ED25519_PUBLIC_LEN>("identity_pubkey")?,
            signature: self.array::<ED25519_SIGNATURE_LEN>("signature")?,
        }))
    }

    fn finish(self) -> Result<(), CodecError> {
        if self.pos != self.buf.len() {
            return Err(CodecError::TrailingBytes {
                kind: self.kind,
                extra: self.buf.len() - self.pos,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) {
        let payload = packet.encode_payload();
        let decoded = Packet::decode(packet.kind(), &payload).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn empty_packets_roundtrip() {
        for p in [
            Packet::Ping,
            Packet::Pong,
            Packet::ClearConsole,
            Packet::NoEncryption,
            Packet::RekeyComplete,
        ] {
            assert!(p.encode_payload().is_empty());
            roundtrip(p);
        }
    }

    #[test]
    fn client_join_roundtrip() {
        roundtrip(Packet::ClientJoin {
            display_name: "alice-1234".into(),
            capabilities: CAP_VIDEO | CAP_AUDIO,
        });
    }

    #[test]
    fn client_join_rejects_oversize_name() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&100u16.to_be_bytes());
        payload.extend_from_slice(&[b'x'; 100]);
        payload.extend_from_slice(&0u32.to_be_bytes());
        assert!(matches!(
            Packet::decode(kind::CLIENT_JOIN, &payload),
            Err(CodecError::InvalidField { field: "display_name", .. })
        ));
    }

    #[test]
    fn terminal_size_roundtrip() {
        roundtrip(Packet::TerminalSize {
            width: 203,
            height: 51,
            flags: 1,
        });
    }

    #[test]
    fn video_frame_roundtrip() {
        let flags = frame_flags(FRAME_FLAG_HAS_COLOR, PixelFormat::Rgb);
        roundtrip(Packet::VideoFrame {
            width: 4,
            height: 2,
            flags,
            pixels: vec![7u8; 4 * 2 * 3],
        });
    }

    #[test]
    fn video_frame_rejects_zero_dimensions() {
        let p = Packet::VideoFrame {
            width: 0,
            height: 2,
            flags: frame_flags(0, PixelFormat::Rgb),
            pixels: vec![],
        };
        assert!(matches!(
            Packet::decode(kind::VIDEO_FRAME, &p.encode_payload()),
            Err(CodecError::InvalidField { field: "dimensions", .. })
        ));
    }

    #[test]
    fn video_frame_rejects_geometry_mismatch() {
        let p = Packet::VideoFrame {
            width: 4,
            height: 4,
            flags: frame_flags(0, PixelFormat::Rgba),
            pixels: vec![0u8; 10], // should be 64
        };
        assert!(matches!(
            Packet::decode(kind::VIDEO_FRAME, &p.encode_payload()),
            Err(CodecError::InvalidField { field: "data_size", .. })
        ));
    }

    #[test]
    fn video_frame_compressed_skips_geometry_check() {
        roundtrip(Packet::VideoFrame {
            width: 640,
            height: 480,
            flags: frame_flags(
                FRAME_FLAG_HAS_COLOR | FRAME_FLAG_IS_COMPRESSED,
                PixelFormat::Rgb,
            ),
            pixels: vec![1, 2, 3, 4, 5],
        });
    }

    #[test]
    fn pixel_format_in_flags_word() {
        let flags = frame_flags(FRAME_FLAG_IS_STRETCHED, PixelFormat::Bgra);
        assert_eq!(frame_pixel_format(flags), Some(PixelFormat::Bgra));
        assert_ne!(flags & FRAME_FLAG_IS_STRETCHED, 0);
        assert_eq!(flags & FRAME_FLAG_HAS_COLOR, 0);
    }

    #[test]
    fn audio_opus_roundtrip() {
        roundtrip(Packet::AudioOpus {
            sample_rate: 48000,
            frame_ms: 20,
            frames: vec![vec![1, 2, 3], vec![4, 5], vec![6]],
        });
    }

    #[test]
    fn audio_opus_rejects_oversized_batch() {
        let p = Packet::AudioOpus {
            sample_rate: 48000,
            frame_ms: 20,
            frames: vec![vec![0u8; 4]; MAX_OPUS_FRAMES + 1],
        };
        assert!(matches!(
            Packet::decode(kind::AUDIO_OPUS, &p.encode_payload()),
            Err(CodecError::InvalidField { field: "frame_count", .. })
        ));
    }

    #[test]
    fn audio_opus_accepts_full_batch() {
        roundtrip(Packet::AudioOpus {
            sample_rate: 48000,
            frame_ms: 20,
            frames: vec![vec![1, 2, 3]; MAX_OPUS_FRAMES],
        });
    }

    #[test]
    fn audio_opus_rejects_bad_rate() {
        let p = Packet::AudioOpus {
            sample_rate: 44100,
            frame_ms: 20,
            frames: vec![vec![0]],
        };
        assert!(matches!(
            Packet::decode(kind::AUDIO_OPUS, &p.encode_payload()),
            Err(CodecError::InvalidField { field: "sample_rate", .. })
        ));
    }

    #[test]
    fn protocol_version_roundtrip() {
        roundtrip(Packet::ProtocolVersion {
            version: PROTOCOL_VERSION_MAJOR,
            revision: PROTOCOL_VERSION_MINOR,
            supports_encryption: true,
            compression: 0,
            compression_threshold: 1024,
            features: 0,
        });
    }

    #[test]
    fn crypto_negotiation_roundtrip() {
        roundtrip(Packet::CryptoCapabilities {
            kex_bitmap: KEX_X25519,
            auth_bitmap: AUTH_ED25519,
            cipher_bitmap: CIPHER_XSALSA20_POLY1305,
            requires_verification: true,
            preferred_kex: 1,
            preferred_auth: 1,
            preferred_cipher: 1,
        });
        roundtrip(Packet::CryptoParameters {
            kex: 1,
            auth: 1,
            cipher: 1,
            kex_pubkey_size: 32,
            signature_size: 64,
            argon2: Argon2Params::default(),
        });
    }

    #[test]
    fn key_exchange_with_and_without_identity() {
        roundtrip(Packet::KeyExchangeInit {
            ephemeral: [0xaa; 32],
            identity: None,
        });
        roundtrip(Packet::KeyExchangeInit {
            ephemeral: [0xaa; 32],
            identity: Some(IdentityProof {
                public_key: [0xbb; 32],
                signature: [0xcc; 64],
            }),
        });
    }

    #[test]
    fn key_exchange_resp_all_shapes() {
        for identity in [
            None,
            Some(IdentityProof {
                public_key: [1; 32],
                signature: [2; 64],
            }),
        ] {
            for client_nonce in [None, Some([3u8; 32])] {
                roundtrip(Packet::KeyExchangeResp {
                    ephemeral: [9; 32],
                    identity: identity.clone(),
                    client_nonce,
                });
            }
        }
    }

    #[test]
    fn key_exchange_resp_rejects_garbage_trailer() {
        let mut payload = vec![0u8; 32];
        payload.extend_from_slice(&[1u8; 7]); // neither identity nor nonce
        assert!(Packet::decode(kind::KEY_EXCHANGE_RESP, &payload).is_err());
    }

    #[test]
    fn auth_packets_roundtrip() {
        roundtrip(Packet::AuthChallenge {
            requirements: AUTH_REQUIRE_PASSWORD | AUTH_REQUIRE_CLIENT_KEY,
            nonce: [0x11; 32],
        });
        roundtrip(Packet::AuthResponse {
            hmac: [0x22; 32],
            identity_pubkey: vec![0x33; 32],
            signature: vec![0x44; 64],
        });
        roundtrip(Packet::AuthSuccess {
            server_hmac: [0x55; 32],
        });
        roundtrip(Packet::AuthFailed {
            reason: "client key not in whitelist".into(),
        });
    }

    #[test]
    fn rekey_packets_roundtrip() {
        roundtrip(Packet::RekeyRequest { ephemeral: [7; 32] });
        roundtrip(Packet::RekeyResponse { ephemeral: [8; 32] });
    }

    #[test]
    fn encrypted_envelope_roundtrip_without_decoding_plaintext() {
        let inner = Packet::Ping.to_frame();
        roundtrip(Packet::Encrypted {
            nonce: [0x99; 24],
            ciphertext: inner,
        });
    }

    #[test]
    fn signalling_roundtrip() {
        let sid = Uuid::new_v4();
        let pid = Uuid::new_v4();
        roundtrip(Packet::SessionLookup {
            session_string: "happy-sunset-ocean".into(),
        });
        roundtrip(Packet::SessionJoin {
            session_string: "happy-sunset-ocean".into(),
            password: Some("hunter2".into()),
        });
        roundtrip(Packet::SessionJoin {
            session_string: "happy-sunset-ocean".into(),
            password: None,
        });
        roundtrip(Packet::SessionInfo {
            session_id: sid,
            session_string: "happy-sunset-ocean".into(),
            participant_count: 3,
        });
        roundtrip(Packet::SessionJoined {
            session_id: sid,
            participant_id: pid,
            server_address: "203.0.113.4".into(),
            server_port: 27224,
            turn: Some(TurnCredentials {
                username: "u".into(),
                password: "p".into(),
                ttl_secs: 600,
            }),
        });
        roundtrip(Packet::SessionJoined {
            session_id: sid,
            participant_id: pid,
            server_address: "203.0.113.4".into(),
            server_port: 27224,
            turn: None,
        });
        roundtrip(Packet::SessionError {
            code: 404,
            message: "no such session".into(),
        });
        roundtrip(Packet::WebRtcSdp {
            session_id: sid,
            recipient_id: Uuid::nil(),
            sdp_kind: SdpKind::Offer,
            sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n".into(),
        });
        roundtrip(Packet::WebRtcIce {
            session_id: sid,
            recipient_id: pid,
            candidate: "candidate:1 1 UDP 2130706431 192.0.2.1 50000 typ host".into(),
            sdp_mid: "0".into(),
            sdp_mline_index: 0,
        });
    }

    #[test]
    fn unknown_type_surfaces() {
        assert!(matches!(
            Packet::decode(0x7abc, &[]),
            Err(CodecError::UnknownType(0x7abc))
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut payload = Packet::Ping.encode_payload();
        payload.push(0);
        assert!(matches!(
            Packet::decode(kind::PING, &payload),
            Err(CodecError::TrailingBytes { extra: 1, .. })
        ));
    }

    #[test]
    fn cleartext_whitelist_covers_handshake_only() {
        for k in [
            kind::PROTOCOL_VERSION,
            kind::NO_ENCRYPTION,
            kind::CRYPTO_CAPABILITIES,
            kind::CRYPTO_PARAMETERS,
            kind::KEY_EXCHANGE_INIT,
            kind::KEY_EXCHANGE_RESP,
            kind::AUTH_CHALLENGE,
            kind::AUTH_RESPONSE,
            kind::AUTH_SUCCESS,
            kind::AUTH_FAILED,
            kind::ENCRYPTED,
        ] {
            assert!(Packet::is_cleartext_kind(k), "0x{k:04x} should be cleartext");
        }
        for k in [
            kind::PING,
            kind::CLIENT_JOIN,
            kind::VIDEO_FRAME,
            kind::AUDIO_OPUS,
            kind::REKEY_REQUEST,
            kind::REKEY_RESPONSE,
            kind::REKEY_COMPLETE,
            kind::SESSION_JOIN,
        ] {
            assert!(!Packet::is_cleartext_kind(k), "0x{k:04x} must be sealed");
        }
    }

    #[test]
    fn frame_and_decode_via_wire() {
        let packet = Packet::ServerState { active_clients: 4 };
        let frame = packet.to_frame();
        let (k, payload) = crate::wire::parse_frame(&frame).unwrap();
        assert_eq!(Packet::decode(k, payload).unwrap(), packet);
    }
}
