use std::time::Duration;

/// Errors from the framing layer (header parse, CRC, bounded reads).
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Clean EOF before a header byte arrived, or the peer closed mid-session.
    #[error("connection closed by peer")]
    Disconnected,
    /// EOF (or short buffer) after the header promised more payload.
    #[error("truncated packet: expected {expected} payload bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    /// Payload bytes do not match the header CRC.
    #[error("payload corrupt: header crc 0x{expected:08x}, computed 0x{actual:08x}")]
    Corrupt { expected: u32, actual: u32 },
    #[error("payload length {0} exceeds maximum packet size")]
    Oversize(usize),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the typed packet codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unknown packet type 0x{0:04x}")]
    UnknownType(u16),
    #[error("short payload for {kind}: expected at least {expected} bytes, got {got}")]
    ShortPayload {
        kind: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{kind}: trailing {extra} undecoded bytes")]
    TrailingBytes { kind: &'static str, extra: usize },
    #[error("invalid {field} in {kind}: {reason}")]
    InvalidField {
        kind: &'static str,
        field: &'static str,
        reason: String,
    },
    #[error("{kind}: string field {field} is not valid UTF-8")]
    BadUtf8 {
        kind: &'static str,
        field: &'static str,
    },
}

/// Transport-level network errors, partitioned by failure mode so callers
/// can decide between retry, reconnect and stage fallback.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("message of {got} bytes exceeds transport limit of {limit}")]
    Size { got: usize, limit: usize },
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic failures. `Auth` is terminal (never retried); the others
/// tear down the session and may reconnect.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("crypto initialization failed: {0}")]
    Init(String),
    #[error("verification failed: {0}")]
    Verification(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("nonce counter exhausted for current key epoch")]
    NonceExhausted,
    #[error("unexpected {got} packet in handshake state {state}")]
    UnexpectedPacket { state: &'static str, got: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_error_messages_name_the_failure() {
        let e = WireError::Corrupt {
            expected: 0xdeadbeef,
            actual: 0x12345678,
        };
        let msg = e.to_string();
        assert!(msg.contains("0xdeadbeef"));
        assert!(msg.contains("0x12345678"));

        let e = WireError::Truncated {
            expected: 100,
            got: 42,
        };
        assert!(e.to_string().contains("100"));
        assert!(e.to_string().contains("42"));
    }

    #[test]
    fn codec_error_unknown_type_is_hex() {
        let e = CodecError::UnknownType(0x7fff);
        assert!(e.to_string().contains("0x7fff"));
    }

    #[test]
    fn network_error_wraps_wire_error() {
        let e: NetworkError = WireError::Disconnected.into();
        assert!(matches!(e, NetworkError::Wire(WireError::Disconnected)));
    }
}
