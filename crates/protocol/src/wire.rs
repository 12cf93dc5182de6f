//! Length-prefixed packet framing shared by every transport.
//!
//! 10 bytes, big-endian:
//! ```text
//! [0..2]   type (u16)
//! [2..6]   length (u32) — payload bytes only
//! [6..10]  crc32 of payload (u32, IEEE polynomial)
//! [10..]   payload
//! ```
//!
//! Byte-stream transports (TCP) read the header, then exactly `length`
//! payload bytes. Message transports (WebSocket, data channel) carry one
//! whole frame per message and use [`parse_frame`] on the message body.
//! The CRC is always checked, including on encrypted envelopes: the
//! envelope's AEAD tag protects the plaintext, the outer CRC protects the
//! envelope itself.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;

pub const HEADER_SIZE: usize = 10;

/// Hard ceiling on payload size. Large enough for an 800x600 RGBA frame
/// plus envelope overhead; anything bigger is a protocol violation.
pub const MAX_PACKET_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: u16,
    pub length: u32,
    pub crc32: u32,
}

impl PacketHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.kind.to_be_bytes());
        buf[2..6].copy_from_slice(&self.length.to_be_bytes());
        buf[6..10].copy_from_slice(&self.crc32.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::Truncated {
                expected: HEADER_SIZE,
                got: buf.len(),
            });
        }
        Ok(Self {
            kind: u16::from_be_bytes([buf[0], buf[1]]),
            length: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            crc32: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }
}

/// Serialize a complete frame (header + payload) into one buffer.
pub fn frame_packet(kind: u16, payload: &[u8]) -> Vec<u8> {
    let header = PacketHeader {
        kind,
        length: payload.len() as u32,
        crc32: crc32fast::hash(payload),
    };
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

/// Parse a complete frame from a single message body, validating length
/// bounds and the payload CRC.
pub fn parse_frame(buf: &[u8]) -> Result<(u16, &[u8]), WireError> {
    let header = PacketHeader::decode(buf)?;
    let length = header.length as usize;
    if length > MAX_PACKET_SIZE {
        return Err(WireError::Oversize(length));
    }
    let body = &buf[HEADER_SIZE..];
    if body.len() < length {
        return Err(WireError::Truncated {
            expected: length,
            got: body.len(),
        });
    }
    let payload = &body[..length];
    let actual = crc32fast::hash(payload);
    if actual != header.crc32 {
        return Err(WireError::Corrupt {
            expected: header.crc32,
            actual,
        });
    }
    Ok((header.kind, payload))
}

/// Read one framed packet from a byte stream.
///
/// EOF before any header byte maps to `Disconnected`; EOF mid-header or
/// mid-payload maps to `Truncated`. Transient `Interrupted` errors are
/// retried by the underlying `read_exact`.
pub async fn read_packet<R>(reader: &mut R) -> Result<(u16, Vec<u8>), WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Err(WireError::Disconnected);
            }
            return Err(WireError::Truncated {
                expected: HEADER_SIZE,
                got: filled,
            });
        }
        filled += n;
    }
    let header = PacketHeader::decode(&header_buf)?;
    let length = header.length as usize;
    if length > MAX_PACKET_SIZE {
        return Err(WireError::Oversize(length));
    }

    let mut payload = vec![0u8; length];
    let mut read = 0;
    while read < length {
        let n = reader.read(&mut payload[read..]).await?;
        if n == 0 {
            return Err(WireError::Truncated {
                expected: length,
                got: read,
            });
        }
        read += n;
    }

    let actual = crc32fast::hash(&payload);
    if actual != header.crc32 {
        return Err(WireError::Corrupt {
            expected: header.crc32,
            actual,
        });
    }
    Ok((header.kind, payload))
}

/// Write one framed packet to a byte stream as a single buffer so the
/// header and payload cannot interleave with another writer's frame.
pub async fn write_packet<W>(writer: &mut W, kind: u16, payload: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_PACKET_SIZE {
        return Err(WireError::Oversize(payload.len()));
    }
    let frame = frame_packet(kind, payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = PacketHeader {
            kind: 0x0010,
            length: 65536,
            crc32: 0xcafebabe,
        };
        let buf = header.encode();
        assert_eq!(PacketHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn header_is_big_endian() {
        let header = PacketHeader {
            kind: 0x0102,
            length: 0x03040506,
            crc32: 0x0708090a,
        };
        let buf = header.encode();
        assert_eq!(
            buf,
            [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a]
        );
    }

    #[test]
    fn frame_and_parse_roundtrip() {
        let payload = b"hello, wire";
        let frame = frame_packet(7, payload);
        assert_eq!(frame.len(), HEADER_SIZE + payload.len());
        let (kind, body) = parse_frame(&frame).unwrap();
        assert_eq!(kind, 7);
        assert_eq!(body, payload);
    }

    #[test]
    fn empty_payload_is_minimum_frame() {
        let frame = frame_packet(1, &[]);
        assert_eq!(frame.len(), HEADER_SIZE);
        let (kind, body) = parse_frame(&frame).unwrap();
        assert_eq!(kind, 1);
        assert!(body.is_empty());
    }

    #[test]
    fn parse_detects_payload_corruption() {
        let mut frame = frame_packet(2, b"payload bytes");
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        match parse_frame(&frame) {
            Err(WireError::Corrupt { .. }) => {}
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn parse_detects_every_single_byte_payload_flip() {
        let frame = frame_packet(2, b"crc should catch all of these");
        for i in HEADER_SIZE..frame.len() {
            let mut mutated = frame.clone();
            mutated[i] ^= 0x40;
            assert!(
                matches!(parse_frame(&mutated), Err(WireError::Corrupt { .. })),
                "flip at byte {i} not detected"
            );
        }
    }

    #[test]
    fn parse_detects_truncation() {
        let frame = frame_packet(3, b"some payload");
        match parse_frame(&frame[..frame.len() - 4]) {
            Err(WireError::Truncated { expected: 12, got: 8 }) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_oversize_length() {
        let mut frame = frame_packet(3, b"x");
        frame[2..6].copy_from_slice(&((MAX_PACKET_SIZE as u32) + 1).to_be_bytes());
        assert!(matches!(parse_frame(&frame), Err(WireError::Oversize(_))));
    }

    #[tokio::test]
    async fn stream_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_packet(&mut a, 0x21, b"stream payload").await.unwrap();
        let (kind, payload) = read_packet(&mut b).await.unwrap();
        assert_eq!(kind, 0x21);
        assert_eq!(payload, b"stream payload");
    }

    #[tokio::test]
    async fn stream_eof_before_header_is_disconnected() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        match read_packet(&mut b).await {
            Err(WireError::Disconnected) => {}
            other => panic!("expected Disconnected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_eof_mid_payload_is_truncated() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = frame_packet(9, b"full payload that will be cut");
        use tokio::io::AsyncWriteExt;
        a.write_all(&frame[..HEADER_SIZE + 5]).await.unwrap();
        drop(a);
        match read_packet(&mut b).await {
            Err(WireError::Truncated { .. }) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_rejects_oversize_before_allocating() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let header = PacketHeader {
            kind: 1,
            length: (MAX_PACKET_SIZE as u32) + 1,
            crc32: 0,
        };
        use tokio::io::AsyncWriteExt;
        a.write_all(&header.encode()).await.unwrap();
        match read_packet(&mut b).await {
            Err(WireError::Oversize(_)) => {}
            other => panic!("expected Oversize, got {other:?}"),
        }
    }
}
