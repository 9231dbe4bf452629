//! Incremental length-prefixed frame decoding (C2, §4.2), shared by every
//! transport (plain TCP, TLS, WebSocket). A WebSocket binary message can
//! contain more than one complete frame back to back, and a TCP/TLS read
//! can split a frame across reads, so every transport feeds raw bytes
//! through the same accumulator instead of each reimplementing the length
//! prefix handling.

use bytes::BytesMut;
use protocol::error::CodecError;
use protocol::header::Header;
use protocol::payload::Payload;
use protocol::pool::BufferPool;
use protocol::{decode_client_frame, validate_len, LENGTH_PREFIX_BYTES};

/// Accumulates bytes from a transport and yields complete client frames as
/// they become available.
pub struct FrameReader {
    buf: BytesMut,
    max_packet_bytes: usize,
}

impl FrameReader {
    pub fn new(max_packet_bytes: usize) -> Self {
        FrameReader { buf: BytesMut::new(), max_packet_bytes }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pulls the next complete frame out of the buffer, if one has fully
    /// arrived. Returns `Ok(None)` when more bytes are needed, not an
    /// error — only a malformed length prefix or header is an error.
    pub fn next_frame(&mut self, pool: &BufferPool) -> Result<Option<(Header, Payload)>, CodecError> {
        if self.buf.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }
        let len = u32::from_le_bytes(self.buf[..LENGTH_PREFIX_BYTES].try_into().unwrap());
        validate_len(len, self.max_packet_bytes)?;
        let total = LENGTH_PREFIX_BYTES + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let frame_bytes = self.buf.split_to(total);
        let (header, payload) = decode_client_frame(&frame_bytes[LENGTH_PREFIX_BYTES..], pool, self.max_packet_bytes)?;
        Ok(Some((header, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::encode_client_frame;
    use protocol::pool::PoolConfig;

    #[test]
    fn yields_nothing_until_a_full_frame_arrives() {
        let pool = BufferPool::new(PoolConfig::default());
        let mut reader = FrameReader::new(1024 * 1024);
        let header = Header::new("Echo", 1, 0, 0).unwrap();
        let frame = encode_client_frame(&header, b"hello", 1024, 1024 * 1024).unwrap();

        reader.feed(&frame[..3]);
        assert!(reader.next_frame(&pool).unwrap().is_none());

        reader.feed(&frame[3..]);
        let (decoded, payload) = reader.next_frame(&pool).unwrap().unwrap();
        assert_eq!(decoded.msg_id(), "Echo");
        assert_eq!(payload.span(), b"hello");
    }

    #[test]
    fn decodes_two_frames_concatenated_in_one_feed() {
        let pool = BufferPool::new(PoolConfig::default());
        let mut reader = FrameReader::new(1024 * 1024);
        let h1 = Header::new("A", 1, 0, 0).unwrap();
        let h2 = Header::new("B", 2, 0, 0).unwrap();
        let f1 = encode_client_frame(&h1, b"one", 1024, 1024 * 1024).unwrap();
        let f2 = encode_client_frame(&h2, b"two", 1024, 1024 * 1024).unwrap();

        let mut combined = Vec::new();
        combined.extend_from_slice(&f1);
        combined.extend_from_slice(&f2);
        reader.feed(&combined);

        let (first, p1) = reader.next_frame(&pool).unwrap().unwrap();
        assert_eq!(first.msg_id(), "A");
        assert_eq!(p1.span(), b"one");
        let (second, p2) = reader.next_frame(&pool).unwrap().unwrap();
        assert_eq!(second.msg_id(), "B");
        assert_eq!(p2.span(), b"two");
        assert!(reader.next_frame(&pool).unwrap().is_none());
    }

    #[test]
    fn rejects_oversized_length_prefix() {
        let pool = BufferPool::new(PoolConfig::default());
        let mut reader = FrameReader::new(16);
        reader.feed(&100u32.to_le_bytes());
        assert!(reader.next_frame(&pool).is_err());
    }
}
