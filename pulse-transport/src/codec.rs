//! Versioned, length-prefixed, checksummed frames
//!
//! ```text
//! +------+---------+-------+-------------+---------------+-----------------+
//! | "PN" | version | flags | length (BE) | checksum (BE) | JSON payload    |
//! | 2 B  | 1 B     | 1 B   | 4 B         | 4 B           | `length` bytes  |
//! +------+---------+-------+-------------+---------------+-----------------+
//! ```
//!
//! The checksum is the first four bytes of the BLAKE3 hash of the payload.

use pulse_core::{ProtocolError, SwarmMessage};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_MAGIC: [u8; 2] = *b"PN";
pub const WIRE_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 12;

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub length: u32,
    pub checksum: u32,
}

/// Errors surfaced while reading frames off a stream.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CodecError {
    /// Whether the stream can no longer be trusted to be aligned on a frame
    /// boundary and must be closed.
    pub fn is_fatal(&self) -> bool {
        match self {
            CodecError::Io(_) => true,
            CodecError::Protocol(err) => matches!(
                err,
                ProtocolError::MalformedFrame { .. }
                    | ProtocolError::FrameTooLarge { .. }
                    | ProtocolError::UnsupportedVersion { .. }
            ),
        }
    }
}

/// Frame checksum of `payload`.
pub fn checksum(payload: &[u8]) -> u32 {
    let hash = blake3::hash(payload);
    let b = hash.as_bytes();
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Serialize `message` into a complete frame.
pub fn encode_frame(message: &SwarmMessage, max_payload: usize) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(message).map_err(|e| ProtocolError::MalformedFrame {
        reason: format!("failed to encode message: {e}"),
    })?;
    if payload.len() > max_payload {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: max_payload,
        });
    }
    let length = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: payload.len(),
        max: max_payload,
    })?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.push(WIRE_VERSION);
    frame.push(0);
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&checksum(&payload).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parse and bound-check a frame header.
pub fn parse_header(bytes: &[u8; HEADER_LEN], max_payload: usize) -> Result<FrameHeader, ProtocolError> {
    if bytes[0..2] != FRAME_MAGIC {
        return Err(ProtocolError::MalformedFrame {
            reason: format!("bad magic {:02x}{:02x}", bytes[0], bytes[1]),
        });
    }
    let version = bytes[2];
    if version != WIRE_VERSION {
        return Err(ProtocolError::UnsupportedVersion { version });
    }
    let length = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if length as usize > max_payload {
        return Err(ProtocolError::FrameTooLarge {
            len: length as usize,
            max: max_payload,
        });
    }
    Ok(FrameHeader {
        version,
        flags: bytes[3],
        length,
        checksum: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
    })
}

/// Verify and parse a payload against its header.
pub fn decode_payload(header: &FrameHeader, payload: &[u8]) -> Result<SwarmMessage, ProtocolError> {
    let got = checksum(payload);
    if got != header.checksum {
        return Err(ProtocolError::ChecksumMismatch {
            expected: header.checksum,
            got,
        });
    }
    let message: SwarmMessage =
        serde_json::from_slice(payload).map_err(|e| ProtocolError::Decode {
            reason: e.to_string(),
        })?;
    if !message.payload_matches_type() {
        return Err(ProtocolError::PayloadMismatch {
            declared: format!("{:?}", message.message_type),
        });
    }
    Ok(message)
}

/// Decode one complete frame held in `frame`.
pub fn decode_frame(frame: &[u8], max_payload: usize) -> Result<SwarmMessage, ProtocolError> {
    let header_bytes: &[u8; HEADER_LEN] = frame
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| ProtocolError::MalformedFrame {
            reason: format!("frame shorter than {HEADER_LEN}-byte header"),
        })?;
    let header = parse_header(header_bytes, max_payload)?;
    let payload = &frame[HEADER_LEN..];
    if payload.len() != header.length as usize {
        return Err(ProtocolError::MalformedFrame {
            reason: format!(
                "declared length {} but {} payload bytes present",
                header.length,
                payload.len()
            ),
        });
    }
    decode_payload(&header, payload)
}

/// Read the next frame. Returns `Ok(None)` when the peer closed the stream.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Option<SwarmMessage>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = parse_header(&header_bytes, max_payload)?;

    let mut payload = vec![0u8; header.length as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(decode_payload(&header, &payload)?))
}

/// Write `message` as one frame and flush.
pub async fn write_frame<W>(writer: &mut W, message: &SwarmMessage, max_payload: usize) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message, max_payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use pulse_core::{MessagePayload, MAX_FRAME_BYTES};
    use pulse_test_utils::generators::arb_swarm_message;

    fn sample() -> SwarmMessage {
        SwarmMessage::new(
            "phone",
            MessagePayload::Gossip {
                topic: "weather".to_string(),
                data: serde_json::json!({"temp": 21}),
            },
        )
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(&sample(), MAX_FRAME_BYTES).unwrap();
        assert_eq!(&frame[0..2], b"PN");
        assert_eq!(frame[2], WIRE_VERSION);
        let len = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
        assert_eq!(len, frame.len() - HEADER_LEN);
        let sum = u32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]);
        assert_eq!(sum, checksum(&frame[HEADER_LEN..]));
    }

    #[test]
    fn test_flipped_payload_byte_fails_checksum() {
        let mut frame = encode_frame(&sample(), MAX_FRAME_BYTES).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        let err = decode_frame(&frame, MAX_FRAME_BYTES).unwrap_err();
        assert!(matches!(err, ProtocolError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut frame = encode_frame(&sample(), MAX_FRAME_BYTES).unwrap();
        frame[2] = 9;
        let err = decode_frame(&frame, MAX_FRAME_BYTES).unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedVersion { version: 9 });
    }

    #[test]
    fn test_bad_magic_and_truncation_rejected() {
        let mut frame = encode_frame(&sample(), MAX_FRAME_BYTES).unwrap();
        frame[0] = b'X';
        assert!(matches!(
            decode_frame(&frame, MAX_FRAME_BYTES),
            Err(ProtocolError::MalformedFrame { .. })
        ));
        assert!(matches!(
            decode_frame(&frame[..5], MAX_FRAME_BYTES),
            Err(ProtocolError::MalformedFrame { .. })
        ));
        let good = encode_frame(&sample(), MAX_FRAME_BYTES).unwrap();
        assert!(matches!(
            decode_frame(&good[..good.len() - 3], MAX_FRAME_BYTES),
            Err(ProtocolError::MalformedFrame { .. })
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let err = encode_frame(&sample(), 8).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { max: 8, .. }));
    }

    #[test]
    fn test_payload_type_mismatch_rejected() {
        let mut msg = sample();
        msg.message_type = pulse_core::MessageType::TaskRequest;
        let frame = encode_frame(&msg, MAX_FRAME_BYTES).unwrap();
        assert!(matches!(
            decode_frame(&frame, MAX_FRAME_BYTES),
            Err(ProtocolError::PayloadMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_async_read_write_sequence() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let first = sample();
        let second = sample().to("tablet");
        write_frame(&mut client, &first, MAX_FRAME_BYTES).await.unwrap();
        write_frame(&mut client, &second, MAX_FRAME_BYTES).await.unwrap();
        drop(client);

        let a = read_frame(&mut server, MAX_FRAME_BYTES).await.unwrap();
        let b = read_frame(&mut server, MAX_FRAME_BYTES).await.unwrap();
        let end = read_frame(&mut server, MAX_FRAME_BYTES).await.unwrap();
        assert_eq!(a, Some(first));
        assert_eq!(b, Some(second));
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_checksum_error_is_not_fatal() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let mut bad = encode_frame(&sample(), MAX_FRAME_BYTES).unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        client.write_all(&bad).await.unwrap();
        write_frame(&mut client, &sample(), MAX_FRAME_BYTES).await.unwrap();

        let err = read_frame(&mut server, MAX_FRAME_BYTES).await.unwrap_err();
        assert!(!err.is_fatal());
        // stream stays aligned after a checksum failure
        assert!(read_frame(&mut server, MAX_FRAME_BYTES).await.unwrap().is_some());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Every message type survives a frame round-trip field for field.
        #[test]
        fn prop_frame_roundtrip(msg in arb_swarm_message()) {
            let frame = encode_frame(&msg, MAX_FRAME_BYTES).unwrap();
            let back = decode_frame(&frame, MAX_FRAME_BYTES).unwrap();
            prop_assert_eq!(back, msg);
        }

        /// Arbitrary bytes never panic the decoder.
        #[test]
        fn prop_garbage_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode_frame(&bytes, MAX_FRAME_BYTES);
        }
    }
}
