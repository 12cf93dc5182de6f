//! Cryptographic primitives and per-session key state.
//!
//! Thin wrappers over the dalek/RustCrypto stack: X25519 ephemeral key
//! exchange, Ed25519 identity signatures, XSalsa20-Poly1305 envelopes,
//! Argon2id password keys and HMAC-SHA256 challenge responses.
//!
//! [`CryptoSession`] owns the installed session keys. Envelope nonces are
//! `random(16) || counter(8)`, counter per key epoch starting at zero.
//! Rekeying keeps two candidate receive keys during the handover window;
//! the first successful open under the new key commits the epoch and wipes
//! the old key, so no in-flight packet is lost and no old-key ciphertext
//! is accepted after commit.

pub mod handshake;
pub mod identity;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use glyphchat_protocol::error::CryptoError;
use glyphchat_protocol::packet::{Argon2Params, ENVELOPE_NONCE_LEN, Packet};

pub const SESSION_KEY_LEN: usize = 32;

/// Message cap per key; crossing it without a rekey is a hard failure.
pub const NONCE_COUNTER_MAX: u64 = 1 << 48;

pub const REKEY_BYTE_THRESHOLD: u64 = 1024 * 1024 * 1024;
pub const REKEY_TIME_THRESHOLD: Duration = Duration::from_secs(3600);

type HmacSha256 = Hmac<Sha256>;

/// A derived symmetric key, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey(pub(crate) [u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

/// Generate an ephemeral X25519 keypair.
pub fn generate_ephemeral() -> (EphemeralSecret, PublicKey) {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Derive the session key from a completed X25519 exchange.
///
/// The salt binds both ephemeral public keys in initiator-then-responder
/// order, so both sides derive byte-identical keys.
pub fn derive_session_key(
    shared: &[u8; 32],
    initiator_pub: &PublicKey,
    responder_pub: &PublicKey,
) -> SessionKey {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(initiator_pub.as_bytes());
    salt[32..].copy_from_slice(responder_pub.as_bytes());
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = [0u8; SESSION_KEY_LEN];
    hk.expand(b"glyphchat session key v1", &mut okm)
        .expect("okm length is valid for sha256");
    SessionKey(okm)
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time HMAC comparison.
pub fn verify_hmac(key: &[u8], data: &[u8], expected: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.verify_slice(expected).is_ok()
}

/// Argon2id password key, parameters as negotiated in CryptoParameters.
pub fn derive_password_key(
    password: &str,
    salt: &[u8],
    params: &Argon2Params,
) -> Result<SessionKey, CryptoError> {
    let argon_params = argon2::Params::new(
        params.m_cost,
        params.t_cost,
        params.parallelism as u32,
        Some(SESSION_KEY_LEN),
    )
    .map_err(|e| CryptoError::Init(format!("argon2 parameters: {e}")))?;
    let argon = argon2::Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon_params,
    );
    let mut out = [0u8; SESSION_KEY_LEN];
    argon
        .hash_password_into(password.as_bytes(), salt, &mut out)
        .map_err(|e| CryptoError::Init(format!("argon2: {e}")))?;
    Ok(SessionKey(out))
}

pub fn random_nonce32() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

struct CryptoInner {
    epoch: u64,
    send_key: SessionKey,
    recv_key: SessionKey,
    /// Next-epoch key while a rekey window is open.
    next_key: Option<SessionKey>,
    /// True once send traffic already runs on `next_key` (requester side).
    send_on_next: bool,
    /// Requester's ephemeral secret, held between request and response.
    pending: Option<EphemeralSecret>,
    send_counter: u64,
    last_rekey: Instant,
}

/// Symmetric state for one established session.
///
/// `seal`/`open` take the lock only long enough to read a consistent
/// key/nonce pair; the AEAD work runs on a local key copy.
pub struct CryptoSession {
    inner: Mutex<CryptoInner>,
    bytes_since_rekey: AtomicU64,
    byte_threshold: u64,
    time_threshold: Duration,
}

impl CryptoSession {
    pub fn new(key: SessionKey) -> Self {
        Self::with_thresholds(key, REKEY_BYTE_THRESHOLD, REKEY_TIME_THRESHOLD)
    }

    pub fn with_thresholds(key: SessionKey, byte_threshold: u64, time_threshold: Duration) -> Self {
        Self {
            inner: Mutex::new(CryptoInner {
                epoch: 0,
                send_key: key.clone(),
                recv_key: key,
                next_key: None,
                send_on_next: false,
                pending: None,
                send_counter: 0,
                last_rekey: Instant::now(),
            }),
            bytes_since_rekey: AtomicU64::new(0),
            byte_threshold,
            time_threshold,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// Seal a complete wire frame into an encrypted envelope packet.
    pub fn seal(&self, frame: &[u8]) -> Result<Packet, CryptoError> {
        let (key, nonce) = {
            let mut inner = self.inner.lock();
            if inner.send_counter >= NONCE_COUNTER_MAX {
                return Err(CryptoError::NonceExhausted);
            }
            let mut nonce = [0u8; ENVELOPE_NONCE_LEN];
            OsRng.fill_bytes(&mut nonce[..16]);
            nonce[16..].copy_from_slice(&inner.send_counter.to_be_bytes());
            inner.send_counter += 1;
            (inner.send_key.clone(), nonce)
        };
        let cipher = XSalsa20Poly1305::new(Key::from_slice(key.as_bytes()));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), frame)
            .map_err(|_| CryptoError::Init("aead seal failed".into()))?;
        self.bytes_since_rekey
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(Packet::Encrypted { nonce, ciphertext })
    }

    /// Open an envelope, returning the plaintext frame.
    ///
    /// During a rekey window the next-epoch key is tried first; the first
    /// success under it commits the epoch. Plaintext is never returned
    /// from a failed open.
    pub fn open(&self, nonce: &[u8; ENVELOPE_NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (next, current) = {
            let inner = self.inner.lock();
            (inner.next_key.clone(), inner.recv_key.clone())
        };

        if let Some(next_key) = next {
            let cipher = XSalsa20Poly1305::new(Key::from_slice(next_key.as_bytes()));
            if let Ok(plain) = cipher.decrypt(Nonce::from_slice(nonce), ciphertext) {
                self.commit_epoch();
                return Ok(plain);
            }
        }

        let cipher = XSalsa20Poly1305::new(Key::from_slice(current.as_bytes()));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Verification("aead open failed".into()))
    }

    /// First traffic under the new key observed: promote it on both
    /// directions and wipe the old epoch's keys.
    fn commit_epoch(&self) {
        let mut inner = self.inner.lock();
        let Some(next) = inner.next_key.take() else {
            return;
        };
        inner.recv_key = next.clone();
        if !inner.send_on_next {
            inner.send_key = next;
            inner.send_counter = 0;
        }
        inner.send_on_next = false;
        inner.epoch += 1;
        inner.last_rekey = Instant::now();
        self.bytes_since_rekey.store(0, Ordering::Relaxed);
    }

    /// Whether a rekey should be initiated (byte, time or nonce budget).
    pub fn needs_rekey(&self) -> bool {
        let inner = self.inner.lock();
        if inner.next_key.is_some() || inner.pending.is_some() {
            return false; // one in flight already
        }
        if inner.send_counter >= NONCE_COUNTER_MAX / 2 {
            return true;
        }
        if inner.last_rekey.elapsed() >= self.time_threshold {
            return true;
        }
        drop(inner);
        self.bytes_since_rekey.load(Ordering::Relaxed) >= self.byte_threshold
    }

    /// Requester side: produce our fresh ephemeral public key.
    pub fn begin_rekey(&self) -> Result<[u8; 32], CryptoError> {
        let mut inner = self.inner.lock();
        if inner.pending.is_some() || inner.next_key.is_some() {
            return Err(CryptoError::Init("rekey already in flight".into()));
        }
        let (secret, public) = generate_ephemeral();
        inner.pending = Some(secret);
        Ok(*public.as_bytes())
    }

    /// Requester side: peer answered with its ephemeral. Derive the next
    /// key and move sending onto it; RekeyComplete and everything after it
    /// goes out under the new key while old-key receives still succeed.
    pub fn complete_rekey_request(&self, peer_ephemeral: &[u8; 32]) -> Result<(), CryptoError> {
        let mut inner = self.inner.lock();
        let secret = inner
            .pending
            .take()
            .ok_or_else(|| CryptoError::Init("rekey response without request".into()))?;
        let our_pub = PublicKey::from(&secret);
        let peer_pub = PublicKey::from(*peer_ephemeral);
        let shared = secret.diffie_hellman(&peer_pub);
        let next = derive_session_key(shared.as_bytes(), &our_pub, &peer_pub);
        inner.send_key = next.clone();
        inner.send_counter = 0;
        inner.send_on_next = true;
        inner.next_key = Some(next);
        Ok(())
    }

    /// Responder side: peer requested a rekey. Derive the next key, start
    /// accepting it on receive, keep sending under the old key until the
    /// peer's RekeyComplete arrives. Returns our ephemeral public key.
    pub fn respond_rekey(&self, peer_ephemeral: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
        let mut inner = self.inner.lock();
        if inner.next_key.is_some() {
            return Err(CryptoError::Init("rekey already in flight".into()));
        }
        let (secret, public) = generate_ephemeral();
        let peer_pub = PublicKey::from(*peer_ephemeral);
        let shared = secret.diffie_hellman(&peer_pub);
        let next = derive_session_key(shared.as_bytes(), &peer_pub, &public);
        inner.next_key = Some(next);
        inner.send_on_next = false;
        Ok(*public.as_bytes())
    }

    pub fn bytes_since_rekey(&self) -> u64 {
        self.bytes_since_rekey.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CryptoSession")
            .field("epoch", &inner.epoch)
            .field("send_counter", &inner.send_counter)
            .field("rekey_in_flight", &inner.next_key.is_some())
            .finish()
    }
}
