//! Long-term Ed25519 identities, fingerprints, and the two trust files:
//! known-hosts (client pins server keys) and client-keys (server whitelist).
//!
//! Known-hosts line format: `hostname:port algorithm fingerprint-hex [comment]`
//! Client-keys line format: `algorithm public-key-hex [comment]`
//! Lines starting with `#` and blank lines are ignored in both.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use glyphchat_protocol::error::CryptoError;

pub const FINGERPRINT_ALGORITHM: &str = "ed25519";

type Blake2b256 = Blake2b<U32>;

/// Hex BLAKE2b-256 fingerprint of an identity public key.
pub fn fingerprint(public_key: &VerifyingKey) -> String {
    let digest = Blake2b256::digest(public_key.as_bytes());
    hex_encode(&digest)
}

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

pub fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Long-term Ed25519 identity keypair.
pub struct IdentityKeypair {
    signing: SigningKey,
}

impl IdentityKeypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Load a key file, generating and persisting a fresh identity when
    /// the file does not exist yet. `gpg:<keyid>` references resolve via
    /// an external agent and are not handled here.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if let Some(rest) = path.to_str().and_then(|s| s.strip_prefix("gpg:")) {
            return Err(CryptoError::Init(format!(
                "gpg-backed identity '{rest}' requires the key agent"
            )));
        }
        if path.exists() {
            return Self::load(path);
        }
        let keypair = Self::generate();
        keypair.save(path)?;
        Ok(keypair)
    }

    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| CryptoError::Init(format!("read identity key {}: {e}", path.display())))?;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let algorithm = parts.next().unwrap_or_default();
            if algorithm != FINGERPRINT_ALGORITHM {
                return Err(CryptoError::Init(format!(
                    "unsupported identity algorithm '{algorithm}'"
                )));
            }
            let seed_hex = parts
                .next()
                .ok_or_else(|| CryptoError::Init("identity key file missing seed".into()))?;
            let seed = hex_decode(seed_hex)
                .filter(|s| s.len() == 32)
                .ok_or_else(|| CryptoError::Init("identity seed is not 32 hex bytes".into()))?;
            let seed: [u8; 32] = seed.try_into().expect("length checked");
            return Ok(Self::from_seed(&seed));
        }
        Err(CryptoError::Init(format!(
            "no identity key found in {}",
            path.display()
        )))
    }

    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CryptoError::Init(format!("create {}: {e}", parent.display())))?;
        }
        let line = format!(
            "{FINGERPRINT_ALGORITHM} {} glyphchat-identity\n",
            hex_encode(&self.signing.to_bytes())
        );
        fs::write(path, line)
            .map_err(|e| CryptoError::Init(format!("write identity key {}: {e}", path.display())))
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

/// Verify an Ed25519 signature made by `public_key` over `message`.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(&sig_bytes)).is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHostEntry {
    pub host: String,
    pub port: u16,
    pub algorithm: String,
    pub fingerprint: String,
    pub comment: Option<String>,
}

/// Result of checking a server fingerprint against the known-hosts file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostVerification {
    /// Fingerprint matches the stored entry.
    Match,
    /// First contact; no entry stored yet.
    Unknown,
    /// Stored fingerprint differs — possible man-in-the-middle.
    Mismatch { stored: String },
}

/// The client's pinned-server-keys file.
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn lookup(&self, host: &str, port: u16) -> Result<Option<KnownHostEntry>, CryptoError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CryptoError::Init(format!(
                    "read known-hosts {}: {e}",
                    self.path.display()
                )));
            }
        };
        for line in contents.lines() {
            if let Some(entry) = parse_known_host_line(line)
                && entry.host == host
                && entry.port == port
            {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    pub fn verify(
        &self,
        host: &str,
        port: u16,
        fingerprint: &str,
    ) -> Result<HostVerification, CryptoError> {
        match self.lookup(host, port)? {
            None => Ok(HostVerification::Unknown),
            Some(entry) if entry.fingerprint == fingerprint => Ok(HostVerification::Match),
            Some(entry) => Ok(HostVerification::Mismatch {
                stored: entry.fingerprint,
            }),
        }
    }

    /// Append a first-contact record.
    pub fn record(
        &self,
        host: &str,
        port: u16,
        fingerprint: &str,
        comment: &str,
    ) -> Result<(), CryptoError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CryptoError::Init(format!("create {}: {e}", parent.display())))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                CryptoError::Init(format!("open known-hosts {}: {e}", self.path.display()))
            })?;
        writeln!(file, "{host}:{port} {FINGERPRINT_ALGORITHM} {fingerprint} {comment}").map_err(
            |e| CryptoError::Init(format!("append known-hosts {}: {e}", self.path.display())),
        )
    }
}

fn parse_known_host_line(line: &str) -> Option<KnownHostEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut parts = line.split_whitespace();
    let endpoint = parts.next()?;
    let (host, port) = endpoint.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let algorithm = parts.next()?.to_string();
    let fingerprint = parts.next()?.to_string();
    let comment = {
        let rest: Vec<&str> = parts.collect();
        if rest.is_empty() {
            None
        } else {
            Some(rest.join(" "))
        }
    };
    Some(KnownHostEntry {
        host: host.to_string(),
        port,
        algorithm,
        fingerprint,
        comment,
    })
}

/// Server-side whitelist of allowed client identity keys.
pub struct ClientWhitelist {
    keys: Vec<[u8; 32]>,
}

impl ClientWhitelist {
    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| CryptoError::Init(format!("read client keys {}: {e}", path.display())))?;
        Ok(Self::parse(&contents))
    }

    pub fn parse(contents: &str) -> Self {
        let mut keys = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let Some(algorithm) = parts.next() else { continue };
            if algorithm != FINGERPRINT_ALGORITHM {
                continue;
            }
            let Some(key_hex) = parts.next() else { continue };
            if let Some(bytes) = hex_decode(key_hex)
                && let Ok(key) = <[u8; 32]>::try_from(bytes.as_slice())
            {
                keys.push(key);
            }
        }
        Self { keys }
    }

    pub fn contains(&self, public_key: &[u8]) -> bool {
        match <[u8; 32]>::try_from(public_key) {
            Ok(key) => self.keys.contains(&key),
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
