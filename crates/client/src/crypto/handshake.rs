//! Authenticated key-exchange state machine.
//!
//! Both roles speak the same transport-based protocol, so the loopback
//! tests can drive a real client against a real responder:
//!
//! ```text
//! Init ─► KeyExchange ─► Authenticating ─► Ready
//!              │               │              │
//!              └───────────────┴──────► Failed (sink)
//! ```
//!
//! Wire order: ProtocolVersion (both) → CryptoCapabilities →
//! CryptoParameters → KeyExchangeInit (responder) → KeyExchangeResp →
//! AuthChallenge → AuthResponse → AuthSuccess | AuthFailed. A client
//! running without encryption answers KeyExchangeInit with NoEncryption
//! and finishes in `Disabled`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use glyphchat_protocol::error::{CodecError, CryptoError, NetworkError};
use glyphchat_protocol::packet::{
    AUTH_REQUIRE_CLIENT_KEY, AUTH_REQUIRE_PASSWORD, Argon2Params, AUTH_ED25519,
    CIPHER_XSALSA20_POLY1305, ED25519_PUBLIC_LEN, ED25519_SIGNATURE_LEN, IdentityProof,
    KEX_X25519, Packet, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR, X25519_PUBLIC_LEN,
};

use super::identity::{
    ClientWhitelist, FINGERPRINT_ALGORITHM, HostVerification, IdentityKeypair, KnownHosts,
    fingerprint, verify_signature,
};
use super::{
    CryptoSession, REKEY_BYTE_THRESHOLD, REKEY_TIME_THRESHOLD, SessionKey, derive_password_key,
    derive_session_key, generate_ephemeral, hmac_sha256, random_nonce32, verify_hmac,
};
use crate::transport::{PacketTransport, TransportError, recv_timeout};

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

const SERVER_SIGN_CONTEXT: &[u8] = b"server";
const CLIENT_SIGN_CONTEXT: &[u8] = b"client";
const AUTH_CONTEXT: &[u8] = b"auth";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Disabled,
    Init,
    KeyExchange,
    Authenticating,
    Ready,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<NetworkError> for HandshakeError {
    fn from(e: NetworkError) -> Self {
        HandshakeError::Transport(TransportError::Net(e))
    }
}

impl HandshakeError {
    /// Authentication rejections are configuration errors and are never
    /// retried by the reconnect loop.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, HandshakeError::Crypto(CryptoError::Auth(_)))
    }
}

/// Result of a completed handshake: `Disabled` (plaintext session) or
/// `Ready` with an installed crypto context.
pub struct HandshakeOutcome {
    pub state: HandshakeState,
    pub crypto: Option<Arc<CryptoSession>>,
    /// Peer's long-term identity key, when one was presented.
    pub peer_identity: Option<[u8; ED25519_PUBLIC_LEN]>,
}

async fn recv_step(transport: &dyn PacketTransport) -> Result<Packet, HandshakeError> {
    let (kind, payload) = recv_timeout(transport, STEP_TIMEOUT).await?;
    Ok(Packet::decode(kind, &payload)?)
}

fn unexpected(state: &'static str, packet: &Packet) -> HandshakeError {
    CryptoError::UnexpectedPacket {
        state,
        got: Packet::kind_name(packet.kind()),
    }
    .into()
}

/// Initiator (client) side of the handshake.
pub struct ClientHandshake {
    pub encrypt: bool,
    pub password: Option<String>,
    pub identity: Option<Arc<IdentityKeypair>>,
    /// Out-of-band pinned server fingerprint; checked before known-hosts.
    pub expected_fingerprint: Option<String>,
    pub known_hosts: Option<KnownHosts>,
    /// Append first-contact fingerprints to known-hosts.
    pub record_first_contact: bool,
    pub server_host: String,
    pub server_port: u16,
    pub rekey_byte_threshold: u64,
    pub rekey_time_threshold: Duration,
    trace: Vec<HandshakeState>,
}

impl ClientHandshake {
    pub fn new(server_host: impl Into<String>, server_port: u16) -> Self {
        Self {
            encrypt: true,
            password: None,
            identity: None,
            expected_fingerprint: None,
            known_hosts: None,
            record_first_contact: true,
            server_host: server_host.into(),
            server_port,
            rekey_byte_threshold: REKEY_BYTE_THRESHOLD,
            rekey_time_threshold: REKEY_TIME_THRESHOLD,
            trace: vec![HandshakeState::Init],
        }
    }

    /// States traversed so far, `Init` first. Terminal state is `Ready`,
    /// `Disabled` or `Failed`.
    pub fn trace(&self) -> &[HandshakeState] {
        &self.trace
    }

    fn transition(&mut self, next: HandshakeState) {
        debug!(?next, "handshake state");
        self.trace.push(next);
    }

    pub async fn run(
        &mut self,
        transport: &dyn PacketTransport,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        match self.run_inner(transport).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.transition(HandshakeState::Failed);
                transport.close().await;
                Err(e)
            }
        }
    }

    async fn run_inner(
        &mut self,
        transport: &dyn PacketTransport,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        transport
            .send(&Packet::ProtocolVersion {
                version: PROTOCOL_VERSION_MAJOR,
                revision: PROTOCOL_VERSION_MINOR,
                supports_encryption: true,
                compression: 0,
                compression_threshold: 0,
                features: 0,
            })
            .await?;
        match recv_step(transport).await? {
            Packet::ProtocolVersion { version, .. } => {
                if version != PROTOCOL_VERSION_MAJOR {
                    return Err(CryptoError::Verification(format!(
                        "peer protocol version {version} (need {PROTOCOL_VERSION_MAJOR})"
                    ))
                    .into());
                }
            }
            other => return Err(unexpected("Init", &other)),
        }

        let wants_verification =
            self.expected_fingerprint.is_some() || self.known_hosts.is_some();
        transport
            .send(&Packet::CryptoCapabilities {
                kex_bitmap: KEX_X25519,
                auth_bitmap: AUTH_ED25519,
                cipher_bitmap: CIPHER_XSALSA20_POLY1305,
                requires_verification: wants_verification,
                preferred_kex: 1,
                preferred_auth: 1,
                preferred_cipher: 1,
            })
            .await?;

        let argon2 = match recv_step(transport).await? {
            Packet::CryptoParameters {
                kex,
                auth,
                cipher,
                kex_pubkey_size,
                signature_size,
                argon2,
            } => {
                if kex != 1 || auth != 1 || cipher != 1 {
                    return Err(CryptoError::Init(format!(
                        "peer selected unsupported algorithms kex={kex} auth={auth} cipher={cipher}"
                    ))
                    .into());
                }
                if kex_pubkey_size as usize != X25519_PUBLIC_LEN
                    || signature_size as usize != ED25519_SIGNATURE_LEN
                {
                    return Err(CryptoError::Init(format!(
                        "peer declared key sizes {kex_pubkey_size}/{signature_size}"
                    ))
                    .into());
                }
                argon2
            }
            other => return Err(unexpected("Init", &other)),
        };

        self.transition(HandshakeState::KeyExchange);
        let (server_ephemeral, server_identity) = match recv_step(transport).await? {
            Packet::KeyExchangeInit {
                ephemeral,
                identity,
            } => (ephemeral, identity),
            other => return Err(unexpected("KeyExchange", &other)),
        };

        if !self.encrypt {
            transport.send(&Packet::NoEncryption).await?;
            info!("encryption disabled; continuing in plaintext");
            self.transition(HandshakeState::Disabled);
            return Ok(HandshakeOutcome {
                state: HandshakeState::Disabled,
                crypto: None,
                peer_identity: None,
            });
        }

        let server_identity = self.verify_server_identity(&server_ephemeral, server_identity)?;

        let (secret, public) = generate_ephemeral();
        let server_pub = x25519_dalek::PublicKey::from(server_ephemeral);
        let shared = secret.diffie_hellman(&server_pub);
        let session_key = derive_session_key(shared.as_bytes(), &public, &server_pub);

        let our_identity = self.identity.as_ref().map(|keypair| {
            let mut message = Vec::with_capacity(X25519_PUBLIC_LEN + CLIENT_SIGN_CONTEXT.len());
            message.extend_from_slice(public.as_bytes());
            message.extend_from_slice(CLIENT_SIGN_CONTEXT);
            IdentityProof {
                public_key: keypair.public_key_bytes(),
                signature: keypair.sign(&message),
            }
        });

        let client_nonce = random_nonce32();
        transport
            .send(&Packet::KeyExchangeResp {
                ephemeral: *public.as_bytes(),
                identity: our_identity,
                client_nonce: Some(client_nonce),
            })
            .await?;

        self.transition(HandshakeState::Authenticating);
        let (requirements, challenge) = match recv_step(transport).await? {
            Packet::AuthChallenge {
                requirements,
                nonce,
            } => (requirements, nonce),
            other => return Err(unexpected("Authenticating", &other)),
        };

        let hmac = if requirements & AUTH_REQUIRE_PASSWORD != 0 {
            let password = self.password.as_deref().ok_or_else(|| {
                CryptoError::Auth("server requires a password and none is configured".into())
            })?;
            let salt_len = (argon2.salt_len as usize).min(challenge.len());
            let pw_key = derive_password_key(password, &challenge[..salt_len], &argon2)?;
            let mut material =
                Vec::with_capacity(challenge.len() + AUTH_CONTEXT.len() + pw_key.0.len());
            material.extend_from_slice(&challenge);
            material.extend_from_slice(AUTH_CONTEXT);
            material.extend_from_slice(pw_key.as_bytes());
            hmac_sha256(session_key.as_bytes(), &material)
        } else {
            [0u8; 32]
        };

        let (identity_pubkey, signature) = if requirements & AUTH_REQUIRE_CLIENT_KEY != 0 {
            let keypair = self.identity.as_ref().ok_or_else(|| {
                CryptoError::Auth("server requires a client identity key and none is loaded".into())
            })?;
            let mut message = Vec::with_capacity(challenge.len() + session_key.0.len());
            message.extend_from_slice(&challenge);
            message.extend_from_slice(session_key.as_bytes());
            (
                keypair.public_key_bytes().to_vec(),
                keypair.sign(&message).to_vec(),
            )
        } else {
            (Vec::new(), Vec::new())
        };

        transport
            .send(&Packet::AuthResponse {
                hmac,
                identity_pubkey,
                signature,
            })
            .await?;

        match recv_step(transport).await? {
            Packet::AuthSuccess { server_hmac } => {
                if !verify_hmac(session_key.as_bytes(), &client_nonce, &server_hmac) {
                    return Err(CryptoError::Verification(
                        "server failed mutual-auth proof over our nonce".into(),
                    )
                    .into());
                }
            }
            Packet::AuthFailed { reason } => {
                warn!(%reason, "server rejected authentication");
                return Err(CryptoError::Auth(reason).into());
            }
            other => return Err(unexpected("Authenticating", &other)),
        }

        self.transition(HandshakeState::Ready);
        let crypto = Arc::new(CryptoSession::with_thresholds(
            session_key,
            self.rekey_byte_threshold,
            self.rekey_time_threshold,
        ));
        transport.set_crypto(Arc::clone(&crypto));
        info!(server = %self.server_host, "handshake complete, channel encrypted");
        Ok(HandshakeOutcome {
            state: HandshakeState::Ready,
            crypto: Some(crypto),
            peer_identity: Some(server_identity),
        })
    }

    fn verify_server_identity(
        &self,
        server_ephemeral: &[u8; X25519_PUBLIC_LEN],
        proof: Option<IdentityProof>,
    ) -> Result<[u8; ED25519_PUBLIC_LEN], HandshakeError> {
        let proof = proof.ok_or_else(|| {
            CryptoError::Verification("server sent no identity key".into())
        })?;

        let mut message = Vec::with_capacity(X25519_PUBLIC_LEN + SERVER_SIGN_CONTEXT.len());
        message.extend_from_slice(server_ephemeral);
        message.extend_from_slice(SERVER_SIGN_CONTEXT);
        if !verify_signature(&proof.public_key, &message, &proof.signature) {
            return Err(CryptoError::Verification(
                "server identity signature does not cover its ephemeral key".into(),
            )
            .into());
        }

        let key = ed25519_dalek::VerifyingKey::from_bytes(&proof.public_key)
            .map_err(|_| CryptoError::Verification("server identity key is invalid".into()))?;
        let presented = fingerprint(&key);

        if let Some(expected) = &self.expected_fingerprint {
            if !expected.eq_ignore_ascii_case(&presented) {
                error!(
                    %expected,
                    %presented,
                    "SERVER KEY MISMATCH: pinned fingerprint does not match"
                );
                return Err(CryptoError::Auth("server key mismatch".into()).into());
            }
            return Ok(proof.public_key);
        }

        if let Some(hosts) = &self.known_hosts {
            match hosts.verify(&self.server_host, self.server_port, &presented)? {
                HostVerification::Match => {
                    debug!(fingerprint = %presented, "server key matches known-hosts");
                }
                HostVerification::Unknown => {
                    if self.record_first_contact {
                        hosts.record(
                            &self.server_host,
                            self.server_port,
                            &presented,
                            "server-0",
                        )?;
                        info!(
                            host = %self.server_host,
                            port = self.server_port,
                            fingerprint = %presented,
                            "first contact: recorded server key"
                        );
                    } else {
                        return Err(CryptoError::Auth(format!(
                            "unknown server key {presented}; verify out of band"
                        ))
                        .into());
                    }
                }
                HostVerification::Mismatch { stored } => {
                    error!(
                        %stored,
                        %presented,
                        "SERVER KEY MISMATCH: possible man-in-the-middle"
                    );
                    return Err(CryptoError::Auth("server key mismatch".into()).into());
                }
            }
        }

        Ok(proof.public_key)
    }
}

/// Responder side of the handshake. The production server lives in its
/// own tree; this implementation exists so sessions can be accepted in
/// loopback tests and on the listening side of peer-to-peer links.
pub struct ServerHandshake {
    pub identity: Arc<IdentityKeypair>,
    /// When set, clients must prove knowledge of this password.
    pub password: Option<String>,
    /// When set, clients must present a whitelisted identity key.
    pub whitelist: Option<ClientWhitelist>,
    pub allow_plaintext: bool,
    pub argon2: Argon2Params,
    pub rekey_byte_threshold: u64,
    pub rekey_time_threshold: Duration,
    trace: Vec<HandshakeState>,
}

impl ServerHandshake {
    pub fn new(identity: Arc<IdentityKeypair>) -> Self {
        Self {
            identity,
            password: None,
            whitelist: None,
            allow_plaintext: true,
            argon2: Argon2Params::default(),
            rekey_byte_threshold: REKEY_BYTE_THRESHOLD,
            rekey_time_threshold: REKEY_TIME_THRESHOLD,
            trace: vec![HandshakeState::Init],
        }
    }

    pub fn trace(&self) -> &[HandshakeState] {
        &self.trace
    }

    fn transition(&mut self, next: HandshakeState) {
        debug!(?next, "handshake state");
        self.trace.push(next);
    }

    pub async fn run(
        &mut self,
        transport: &dyn PacketTransport,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        match self.run_inner(transport).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.transition(HandshakeState::Failed);
                transport.close().await;
                Err(e)
            }
        }
    }

    async fn run_inner(
        &mut self,
        transport: &dyn PacketTransport,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        match recv_step(transport).await? {
            Packet::ProtocolVersion { version, .. } => {
                if version != PROTOCOL_VERSION_MAJOR {
                    return Err(CryptoError::Verification(format!(
                        "peer protocol version {version} (need {PROTOCOL_VERSION_MAJOR})"
                    ))
                    .into());
                }
            }
            other => return Err(unexpected("Init", &other)),
        }
        transport
            .send(&Packet::ProtocolVersion {
                version: PROTOCOL_VERSION_MAJOR,
                revision: PROTOCOL_VERSION_MINOR,
                supports_encryption: true,
                compression: 0,
                compression_threshold: 0,
                features: 0,
            })
            .await?;

        match recv_step(transport).await? {
            Packet::CryptoCapabilities {
                kex_bitmap,
                auth_bitmap,
                cipher_bitmap,
                ..
            } => {
                if kex_bitmap & KEX_X25519 == 0
                    || auth_bitmap & AUTH_ED25519 == 0
                    || cipher_bitmap & CIPHER_XSALSA20_POLY1305 == 0
                {
                    return Err(CryptoError::Init(
                        "no common crypto algorithms with peer".into(),
                    )
                    .into());
                }
            }
            other => return Err(unexpected("Init", &other)),
        }
        transport
            .send(&Packet::CryptoParameters {
                kex: 1,
                auth: 1,
                cipher: 1,
                kex_pubkey_size: X25519_PUBLIC_LEN as u16,
                signature_size: ED25519_SIGNATURE_LEN as u16,
                argon2: self.argon2,
            })
            .await?;

        self.transition(HandshakeState::KeyExchange);
        let (secret, public) = generate_ephemeral();
        let mut message = Vec::with_capacity(X25519_PUBLIC_LEN + SERVER_SIGN_CONTEXT.len());
        message.extend_from_slice(public.as_bytes());
        message.extend_from_slice(SERVER_SIGN_CONTEXT);
        transport
            .send(&Packet::KeyExchangeInit {
                ephemeral: *public.as_bytes(),
                identity: Some(IdentityProof {
                    public_key: self.identity.public_key_bytes(),
                    signature: self.identity.sign(&message),
                }),
            })
            .await?;

        let (client_ephemeral, client_identity, client_nonce) = match recv_step(transport).await? {
            Packet::NoEncryption => {
                if self.allow_plaintext {
                    info!("client opted out of encryption; plaintext session");
                    self.transition(HandshakeState::Disabled);
                    return Ok(HandshakeOutcome {
                        state: HandshakeState::Disabled,
                        crypto: None,
                        peer_identity: None,
                    });
                }
                let reason = "encryption required by this server".to_string();
                transport
                    .send(&Packet::AuthFailed {
                        reason: reason.clone(),
                    })
                    .await?;
                return Err(CryptoError::Auth(reason).into());
            }
            Packet::KeyExchangeResp {
                ephemeral,
                identity,
                client_nonce,
            } => (ephemeral, identity, client_nonce),
            other => return Err(unexpected("KeyExchange", &other)),
        };

        if let Some(proof) = &client_identity {
            let mut message = Vec::with_capacity(X25519_PUBLIC_LEN + CLIENT_SIGN_CONTEXT.len());
            message.extend_from_slice(&client_ephemeral);
            message.extend_from_slice(CLIENT_SIGN_CONTEXT);
            if !verify_signature(&proof.public_key, &message, &proof.signature) {
                return Err(CryptoError::Verification(
                    "client identity signature does not cover its ephemeral key".into(),
                )
                .into());
            }
        }

        let client_pub = x25519_dalek::PublicKey::from(client_ephemeral);
        let shared = secret.diffie_hellman(&client_pub);
        let session_key = derive_session_key(shared.as_bytes(), &client_pub, &public);

        self.transition(HandshakeState::Authenticating);
        let mut requirements = 0u8;
        if self.password.is_some() {
            requirements |= AUTH_REQUIRE_PASSWORD;
        }
        if self.whitelist.is_some() {
            requirements |= AUTH_REQUIRE_CLIENT_KEY;
        }
        let challenge = random_nonce32();
        transport
            .send(&Packet::AuthChallenge {
                requirements,
                nonce: challenge,
            })
            .await?;

        let response = match recv_step(transport).await? {
            Packet::AuthResponse {
                hmac,
                identity_pubkey,
                signature,
            } => (hmac, identity_pubkey, signature),
            other => return Err(unexpected("Authenticating", &other)),
        };

        if let Err(reason) = self.check_auth(&session_key, &challenge, &response, &client_identity)
        {
            transport
                .send(&Packet::AuthFailed {
                    reason: reason.clone(),
                })
                .await?;
            return Err(CryptoError::Auth(reason).into());
        }

        let mutual_nonce = client_nonce.unwrap_or([0u8; 32]);
        transport
            .send(&Packet::AuthSuccess {
                server_hmac: hmac_sha256(session_key.as_bytes(), &mutual_nonce),
            })
            .await?;

        self.transition(HandshakeState::Ready);
        let crypto = Arc::new(CryptoSession::with_thresholds(
            session_key,
            self.rekey_byte_threshold,
            self.rekey_time_threshold,
        ));
        transport.set_crypto(Arc::clone(&crypto));
        info!("handshake complete, channel encrypted");
        Ok(HandshakeOutcome {
            state: HandshakeState::Ready,
            crypto: Some(crypto),
            peer_identity: response.1.try_into().ok().or_else(|| {
                client_identity.map(|p| p.public_key)
            }),
        })
    }

    fn check_auth(
        &self,
        session_key: &SessionKey,
        challenge: &[u8; 32],
        response: &([u8; 32], Vec<u8>, Vec<u8>),
        kex_identity: &Option<IdentityProof>,
    ) -> Result<(), String> {
        let (hmac, identity_pubkey, signature) = response;

        if let Some(password) = &self.password {
            let salt_len = (self.argon2.salt_len as usize).min(challenge.len());
            let pw_key = derive_password_key(password, &challenge[..salt_len], &self.argon2)
                .map_err(|e| format!("password key derivation failed: {e}"))?;
            let mut material =
                Vec::with_capacity(challenge.len() + AUTH_CONTEXT.len() + pw_key.0.len());
            material.extend_from_slice(challenge);
            material.extend_from_slice(AUTH_CONTEXT);
            material.extend_from_slice(pw_key.as_bytes());
            if !verify_hmac(session_key.as_bytes(), &material, hmac) {
                return Err("invalid password".to_string());
            }
        }

        if let Some(whitelist) = &self.whitelist {
            if identity_pubkey.len() != ED25519_PUBLIC_LEN {
                return Err("client sent no identity key".to_string());
            }
            // The key presented at auth must be the one that signed the
            // key exchange, if any was sent there.
            if let Some(proof) = kex_identity
                && proof.public_key.as_slice() != identity_pubkey.as_slice()
            {
                return Err("identity key changed between key exchange and auth".to_string());
            }
            let mut message = Vec::with_capacity(challenge.len() + session_key.0.len());
            message.extend_from_slice(challenge);
            message.extend_from_slice(session_key.as_bytes());
            if !verify_signature(identity_pubkey, &message, signature) {
                return Err("invalid client signature".to_string());
            }
            if !whitelist.contains(identity_pubkey) {
                return Err("client key not in whitelist".to_string());
            }
        }

        Ok(())
    }
}

/// Format a known-hosts style description of an identity, used in logs.
pub fn describe_identity(public_key: &[u8; ED25519_PUBLIC_LEN]) -> String {
    match ed25519_dalek::VerifyingKey::from_bytes(public_key) {
        Ok(key) => format!("{FINGERPRINT_ALGORITHM} {}", fingerprint(&key)),
        Err(_) => format!("{FINGERPRINT_ALGORITHM} <invalid key>"),
    }
}
