//! P2P protocol codec for message framing.
//!
//! Every message on the wire is framed as:
//!
//! ```text
//! +----------+--------------+-------------+----------+
//! |  Magic   |   Command    |   Length    | Checksum |
//! | 4 bytes  |  12 bytes    | 4 bytes LE  | 4 bytes  |
//! +----------+--------------+-------------+----------+
//! |                    Payload                       |
//! |                 (Length bytes)                   |
//! +--------------------------------------------------+
//! ```
//!
//! - Magic: Network identifier (mainnet/testnet)
//! - Command: ASCII name, NUL padded
//! - Length: Payload length in bytes (little-endian)
//! - Checksum: First 4 bytes of SHA256(SHA256(payload))
//! - Payload: Message-specific data
//!
//! Repeated-field counts inside payloads use the compact-size encoding
//! (`read_compact_size` / `write_compact_size`).

use crate::{NetworkError, NetworkResult, RawMessage, MAINNET_MAGIC, MAX_MESSAGE_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use sha2::{Digest, Sha256};
use tokio_util::codec::{Decoder, Encoder};

/// Header size: magic (4) + command (12) + length (4) + checksum (4) = 24 bytes
pub(crate) const HEADER_SIZE: usize = 24;

/// Width of the NUL-padded command field.
pub(crate) const COMMAND_SIZE: usize = 12;

/// Double SHA-256.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Frame checksum: first 4 bytes of the double hash of the payload.
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = sha256d(payload);
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&hash[0..4]);
    checksum
}

/// Message codec for the P2P protocol.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    /// Network magic bytes.
    magic: [u8; 4],
    /// Maximum allowed payload size.
    max_size: usize,
}

impl MessageCodec {
    /// Create a new codec with mainnet magic.
    pub fn new() -> Self {
        Self {
            magic: MAINNET_MAGIC,
            max_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Create a codec with custom magic bytes.
    pub fn with_magic(magic: [u8; 4]) -> Self {
        Self {
            magic,
            max_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Override the maximum payload size.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Network magic this codec frames with.
    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }

    /// Encode one frame into a fresh buffer.
    pub fn frame(&mut self, message: RawMessage) -> NetworkResult<BytesMut> {
        let mut dst = BytesMut::with_capacity(HEADER_SIZE + message.payload.len());
        self.encode(message, &mut dst)?;
        Ok(dst)
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = RawMessage;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Magic is checked as soon as any of it has arrived
        let seen = src.len().min(4);
        if src[..seen] != self.magic[..seen] {
            return Err(NetworkError::MagicMismatch {
                got: src[..seen].to_vec(),
            });
        }

        // Need at least header size
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_le_bytes([src[16], src[17], src[18], src[19]]) as usize;

        // Validate length
        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }

        // Check if we have the full message
        let total_size = HEADER_SIZE + length;
        if src.len() < total_size {
            // Reserve space for the full message
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        let header = src.split_to(HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        let command: String = header[4..4 + COMMAND_SIZE]
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| *b as char)
            .collect();

        if header[20..24] != checksum(&payload) {
            return Err(NetworkError::ChecksumMismatch { command });
        }

        Ok(Some(RawMessage { command, payload }))
    }
}

impl Encoder<RawMessage> for MessageCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: RawMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let name = item.command.as_bytes();
        if name.len() > COMMAND_SIZE {
            return Err(NetworkError::CommandTooLong(item.command));
        }

        let length = item.payload.len();
        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }

        let mut command = [0u8; COMMAND_SIZE];
        command[..name.len()].copy_from_slice(name);

        dst.reserve(HEADER_SIZE + length);

        // Write header
        dst.put_slice(&self.magic);
        dst.put_slice(&command);
        dst.put_u32_le(length as u32);
        dst.put_slice(&checksum(&item.payload));

        // Write payload
        dst.put_slice(&item.payload);

        Ok(())
    }
}

/// Append a compact-size unsigned integer.
pub fn write_compact_size<B: BufMut>(buf: &mut B, value: u64) {
    match value {
        0..=0xFC => buf.put_u8(value as u8),
        0xFD..=0xFFFF => {
            buf.put_u8(0xFD);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xFFFF_FFFF => {
            buf.put_u8(0xFE);
            buf.put_u32_le(value as u32);
        }
        _ => {
            buf.put_u8(0xFF);
            buf.put_u64_le(value);
        }
    }
}

/// Read a compact-size unsigned integer, failing if the buffer runs short.
pub fn read_compact_size<B: Buf>(buf: &mut B) -> NetworkResult<u64> {
    if !buf.has_remaining() {
        return Err(NetworkError::malformed("compact-size", "missing prefix"));
    }
    let prefix = buf.get_u8();
    let width = match prefix {
        0xFD => 2,
        0xFE => 4,
        0xFF => 8,
        _ => return Ok(prefix as u64),
    };
    if buf.remaining() < width {
        return Err(NetworkError::malformed(
            "compact-size",
            format!("need {} bytes, have {}", width, buf.remaining()),
        ));
    }
    Ok(match width {
        2 => buf.get_u16_le() as u64,
        4 => buf.get_u32_le() as u64,
        _ => buf.get_u64_le(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn roundtrip(command: &str, payload: Vec<u8>) -> RawMessage {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(RawMessage::new(command, payload), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn test_checksum_empty_payload() {
        // Well-known checksum of the empty payload (verack)
        assert_eq!(checksum(&[]), [0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn test_codec_roundtrip() {
        for len in [0usize, 1, 36, 4096] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let decoded = roundtrip("getdata", payload.clone());
            assert_eq!(decoded.command, "getdata");
            assert_eq!(decoded.payload, Bytes::from(payload));
        }
    }

    #[test]
    fn test_header_layout() {
        let mut codec = MessageCodec::new();
        let frame = codec.frame(RawMessage::new("verack", Vec::new())).unwrap();
        assert_eq!(frame.len(), HEADER_SIZE);
        assert_eq!(&frame[0..4], &MAINNET_MAGIC);
        assert_eq!(&frame[4..10], b"verack");
        assert_eq!(&frame[10..16], &[0u8; 6]);
        assert_eq!(&frame[16..20], &[0u8; 4]);
        assert_eq!(&frame[20..24], &checksum(&[]));
    }

    #[test]
    fn test_partial_frames() {
        let mut codec = MessageCodec::new();
        let frame = codec
            .frame(RawMessage::new("inv", vec![7u8; 37]))
            .unwrap();

        let mut buf = BytesMut::new();
        for (i, byte) in frame.iter().enumerate() {
            buf.put_u8(*byte);
            let result = codec.decode(&mut buf).unwrap();
            if i + 1 < frame.len() {
                assert!(result.is_none(), "decoded early at byte {}", i);
            } else {
                assert_eq!(result.unwrap().payload.len(), 37);
            }
        }
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut codec = MessageCodec::new();
        let mut buf = codec.frame(RawMessage::new("verack", Vec::new())).unwrap();
        buf.extend_from_slice(&codec.frame(RawMessage::new("getaddr", Vec::new())).unwrap());

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().command, "verack");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().command, "getaddr");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_checksum_tamper() {
        let mut codec = MessageCodec::new();
        let mut frame = codec
            .frame(RawMessage::new("block", vec![1u8; 64]))
            .unwrap();
        frame[HEADER_SIZE + 10] ^= 0x01;

        let err = codec.decode(&mut frame).unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(matches!(err, NetworkError::ChecksumMismatch { ref command } if command == "block"));
    }

    #[test]
    fn test_magic_mismatch_detected_early() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&[0xF9u8, 0x00][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, NetworkError::MagicMismatch { .. }));
        assert!(!err.is_protocol_violation());
    }

    #[test]
    fn test_testnet_magic_rejected_by_mainnet_codec() {
        let mut testnet = MessageCodec::with_magic(crate::TESTNET_MAGIC);
        let mut frame = testnet.frame(RawMessage::new("verack", Vec::new())).unwrap();
        let mut mainnet = MessageCodec::new();
        assert!(mainnet.decode(&mut frame).is_err());
    }

    #[test]
    fn test_oversized_frame() {
        let mut codec = MessageCodec::new().with_max_size(16);
        assert!(matches!(
            codec.frame(RawMessage::new("block", vec![0u8; 17])),
            Err(NetworkError::MessageTooLarge { size: 17, max: 16 })
        ));

        let mut big = MessageCodec::new();
        let mut frame = big.frame(RawMessage::new("block", vec![0u8; 17])).unwrap();
        assert!(matches!(
            codec.decode(&mut frame),
            Err(NetworkError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_command_too_long() {
        let mut codec = MessageCodec::new();
        let err = codec
            .frame(RawMessage::new("thirteenchars", Vec::new()))
            .unwrap_err();
        assert!(matches!(err, NetworkError::CommandTooLong(_)));
    }

    #[test]
    fn test_compact_size_widths() {
        for (value, width) in [
            (0u64, 1usize),
            (0xFC, 1),
            (0xFD, 3),
            (0xFFFF, 3),
            (0x1_0000, 5),
            (0xFFFF_FFFF, 5),
            (0x1_0000_0000, 9),
        ] {
            let mut buf = BytesMut::new();
            write_compact_size(&mut buf, value);
            assert_eq!(buf.len(), width, "width for {:#x}", value);
            let mut slice = &buf[..];
            assert_eq!(read_compact_size(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_compact_size_truncated() {
        let mut empty: &[u8] = &[];
        assert!(read_compact_size(&mut empty).is_err());

        let mut short: &[u8] = &[0xFD, 0x01];
        assert!(read_compact_size(&mut short).is_err());

        let mut short: &[u8] = &[0xFF, 1, 2, 3, 4, 5, 6, 7];
        assert!(read_compact_size(&mut short).is_err());
    }
}
