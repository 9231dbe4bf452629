//! Client wire frame codec (C2, §4.2).
//!
//! ```text
//! len(4, LE) | msgIdLen(1) | msgId(UTF-8) | msgSeq(2) | stageId(8)
//!           | errorCode(2) | originalSize(4) | body(len - headerTotal)
//! ```
//!
//! `len` counts everything *after* the 4-byte length prefix. `originalSize
//! == 0` means the body is stored uncompressed; any other value means the
//! body is LZ4-compressed and `originalSize` is the pre-compression length.
//! Server->client frames use the same shape.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::CodecError;
use crate::header::Header;
use crate::msgids::{MAX_MSG_ID_LEN, MAX_PACKET_BYTES};
use crate::payload::Payload;
use crate::pool::BufferPool;

/// Fixed-size portion of the header after the `msgIdLen` byte and the
/// `msgId` bytes: `msgSeq(2) + stageId(8) + errorCode(2) + originalSize(4)`.
const FIXED_HEADER_TAIL: usize = 2 + 8 + 2 + 4;

/// `len(4)` is read separately by the transport before the rest of the
/// frame is available; this is just the prefix width.
pub const LENGTH_PREFIX_BYTES: usize = 4;

fn header_total(msg_id_len: usize) -> usize {
    1 + msg_id_len + FIXED_HEADER_TAIL
}

/// Validates a `len` field read from the wire before the transport commits
/// to reading that many bytes. Keeps the "never allocate more than `len`
/// bytes" invariant from §8 honest even for malformed frames.
pub fn validate_len(len: u32, max_packet_bytes: usize) -> Result<(), CodecError> {
    let len = len as usize;
    if len == 0 || len > max_packet_bytes {
        return Err(CodecError::FrameLengthOutOfRange {
            len,
            max: max_packet_bytes,
        });
    }
    Ok(())
}

/// Encodes a header + raw body into a single frame, ready to write to the
/// wire. Compression is applied when `body.len() > compression_threshold`.
pub fn encode_client_frame(
    header: &Header,
    body: &[u8],
    compression_threshold: usize,
    max_packet_bytes: usize,
) -> Result<BytesMut, CodecError> {
    let msg_id_bytes = header.msg_id().as_bytes();
    if msg_id_bytes.is_empty() || msg_id_bytes.len() > MAX_MSG_ID_LEN {
        return Err(CodecError::MsgIdLengthOutOfRange {
            len: msg_id_bytes.len(),
            max: MAX_MSG_ID_LEN,
        });
    }

    let (original_size, encoded_body): (u32, Vec<u8>) = if body.len() > compression_threshold {
        let compressed = lz4_flex::compress_prepend_size(body);
        // compress_prepend_size prepends its own 4-byte size; we carry the
        // size in our own header field instead, so strip it back off.
        (body.len() as u32, compressed[4..].to_vec())
    } else {
        (0, body.to_vec())
    };

    let header_total = header_total(msg_id_bytes.len());
    let len = header_total + encoded_body.len();
    if len > max_packet_bytes {
        return Err(CodecError::FrameLengthOutOfRange {
            len,
            max: max_packet_bytes,
        });
    }

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + len);
    frame.put_u32_le(len as u32);
    frame.put_u8(msg_id_bytes.len() as u8);
    frame.put_slice(msg_id_bytes);
    frame.put_u16(header.msg_seq());
    frame.put_i64(header.stage_id());
    frame.put_u16(header.error_code());
    frame.put_u32(original_size);
    frame.put_slice(&encoded_body);
    Ok(frame)
}

/// Decodes the bytes following the 4-byte length prefix (i.e. exactly
/// `len` bytes) into a header and a pooled payload. `len` is re-validated
/// defensively even though the caller should already have checked it via
/// [`validate_len`].
pub fn decode_client_frame(
    data: &[u8],
    pool: &BufferPool,
    max_packet_bytes: usize,
) -> Result<(Header, Payload), CodecError> {
    let len = data.len();
    if len == 0 || len > max_packet_bytes {
        return Err(CodecError::FrameLengthOutOfRange {
            len,
            max: max_packet_bytes,
        });
    }

    let mut cursor = data;
    if cursor.is_empty() {
        return Err(CodecError::UnexpectedEof);
    }
    let msg_id_len = cursor.get_u8() as usize;
    if msg_id_len == 0 || msg_id_len > MAX_MSG_ID_LEN {
        return Err(CodecError::MsgIdLengthOutOfRange {
            len: msg_id_len,
            max: MAX_MSG_ID_LEN,
        });
    }

    let header_total = header_total(msg_id_len);
    if header_total > len {
        return Err(CodecError::HeaderExceedsFrame { header_total, len });
    }
    if cursor.len() < msg_id_len {
        return Err(CodecError::UnexpectedEof);
    }
    let msg_id_bytes = &cursor[..msg_id_len];
    let msg_id =
        std::str::from_utf8(msg_id_bytes).map_err(|_| CodecError::InvalidMsgIdEncoding)?;
    cursor.advance(msg_id_len);

    if cursor.len() < FIXED_HEADER_TAIL {
        return Err(CodecError::UnexpectedEof);
    }
    let msg_seq = cursor.get_u16();
    let stage_id = cursor.get_i64();
    let error_code = cursor.get_u16();
    let original_size = cursor.get_u32() as usize;

    if original_size > max_packet_bytes {
        return Err(CodecError::OriginalSizeOutOfRange {
            original_size,
            max: max_packet_bytes,
        });
    }

    let header = Header::new(msg_id.to_string(), msg_seq, stage_id, error_code)
        .map_err(|_| CodecError::MsgIdLengthOutOfRange {
            len: msg_id_len,
            max: MAX_MSG_ID_LEN,
        })?;

    let payload_size = len - header_total;
    if cursor.len() != payload_size {
        return Err(CodecError::UnexpectedEof);
    }
    let body = cursor;

    if original_size == 0 {
        let mut out = pool.rent(payload_size);
        out.as_mut_slice()[..payload_size].copy_from_slice(body);
        return Ok((header, Payload::from_pooled(out)));
    }

    let mut decompressed = pool.rent(original_size);
    let written = lz4_flex::decompress_into(body, decompressed.as_mut_slice())
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    if written != original_size {
        return Err(CodecError::DecompressedLengthMismatch {
            expected: original_size,
            actual: written,
        });
    }
    Ok((header, Payload::from_pooled(decompressed)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;

    fn pool() -> BufferPool {
        BufferPool::new(PoolConfig::default())
    }

    #[test]
    fn round_trips_small_uncompressed_body() {
        let header = Header::new("Echo", 2, 42, 0).unwrap();
        let body = b"hello";
        let frame = encode_client_frame(&header, body, 1024, MAX_PACKET_BYTES).unwrap();
        let (decoded_header, payload) =
            decode_client_frame(&frame[LENGTH_PREFIX_BYTES..], &pool(), MAX_PACKET_BYTES).unwrap();
        assert_eq!(decoded_header.msg_id(), "Echo");
        assert_eq!(decoded_header.msg_seq(), 2);
        assert_eq!(decoded_header.stage_id(), 42);
        assert_eq!(payload.span(), body);
    }

    #[test]
    fn compresses_above_threshold_and_round_trips() {
        let header = Header::new("Bulk", 5, 0, 0).unwrap();
        let body = vec![7u8; 2000];
        let frame = encode_client_frame(&header, &body, 1024, MAX_PACKET_BYTES).unwrap();
        // originalSize field sits right after msgIdLen+msgId+msgSeq+stageId+errorCode.
        let original_size = u32::from_be_bytes([
            frame[4 + 1 + 4 + 2 + 8],
            frame[4 + 1 + 4 + 2 + 8 + 1],
            frame[4 + 1 + 4 + 2 + 8 + 2],
            frame[4 + 1 + 4 + 2 + 8 + 3],
        ]);
        assert_eq!(original_size, 2000);

        let (_, payload) =
            decode_client_frame(&frame[LENGTH_PREFIX_BYTES..], &pool(), MAX_PACKET_BYTES).unwrap();
        assert_eq!(payload.span(), body.as_slice());
    }

    #[test]
    fn below_threshold_body_is_stored_uncompressed() {
        let header = Header::new("Small", 1, 0, 0).unwrap();
        let body = vec![1u8; 500];
        let frame = encode_client_frame(&header, &body, 1024, MAX_PACKET_BYTES).unwrap();
        let original_size = u32::from_be_bytes([
            frame[4 + 1 + 5 + 2 + 8],
            frame[4 + 1 + 5 + 2 + 8 + 1],
            frame[4 + 1 + 5 + 2 + 8 + 2],
            frame[4 + 1 + 5 + 2 + 8 + 3],
        ]);
        assert_eq!(original_size, 0);
    }

    #[test]
    fn rejects_frame_length_over_maximum() {
        assert!(validate_len(MAX_PACKET_BYTES as u32 + 1, MAX_PACKET_BYTES).is_err());
    }

    #[test]
    fn rejects_msg_id_len_zero() {
        let mut data = vec![0u8]; // msgIdLen = 0
        data.extend_from_slice(&[0u8; FIXED_HEADER_TAIL]);
        let err = decode_client_frame(&data, &pool(), MAX_PACKET_BYTES).unwrap_err();
        assert!(matches!(err, CodecError::MsgIdLengthOutOfRange { .. }));
    }

    #[test]
    fn rejects_header_exceeding_frame_length() {
        // msgIdLen says 10 but frame is too short to contain it.
        let data = vec![10u8, b'a', b'b'];
        let err = decode_client_frame(&data, &pool(), MAX_PACKET_BYTES).unwrap_err();
        assert!(matches!(err, CodecError::HeaderExceedsFrame { .. }));
    }
}
