//! Inter-server mesh frame (C5, §5). Sent as a ZeroMQ multipart message
//! with four parts: destination server-id, source server-id, a serialized
//! route header, and the payload bytes. Keeping the addressing in separate
//! parts lets a ROUTER-style socket dispatch on the destination part alone
//! without touching the rest of the message.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::CodecError;
use crate::header::Header;
use crate::msgids::MAX_MSG_ID_LEN;

/// The four logical fields of one mesh hop. `header` is re-serialized with
/// the same fixed layout as the client frame header (minus the outer
/// length prefix, since ZMQ already frames the message for us).
pub struct MeshFrame {
    pub to: String,
    pub from: String,
    pub header: Header,
    pub body: Vec<u8>,
}

impl MeshFrame {
    pub fn new(to: impl Into<String>, from: impl Into<String>, header: Header, body: Vec<u8>) -> Self {
        MeshFrame {
            to: to.into(),
            from: from.into(),
            header,
            body,
        }
    }
}

/// Serializes a [`MeshFrame`] into the four ZMQ multipart parts, in the
/// order a ROUTER/DEALER mesh socket expects: `[to, from, header, body]`.
pub fn encode_mesh_frame(frame: &MeshFrame) -> Result<[Vec<u8>; 4], CodecError> {
    let msg_id_bytes = frame.header.msg_id().as_bytes();
    if msg_id_bytes.is_empty() || msg_id_bytes.len() > MAX_MSG_ID_LEN {
        return Err(CodecError::MsgIdLengthOutOfRange {
            len: msg_id_bytes.len(),
            max: MAX_MSG_ID_LEN,
        });
    }

    let mut header_bytes = BytesMut::with_capacity(1 + msg_id_bytes.len() + 2 + 8 + 2 + 1 + 1 + 1 + 1 + 1 + frame.header.from().len());
    header_bytes.put_u8(msg_id_bytes.len() as u8);
    header_bytes.put_slice(msg_id_bytes);
    header_bytes.put_u16(frame.header.msg_seq());
    header_bytes.put_i64(frame.header.stage_id());
    header_bytes.put_u16(frame.header.error_code());
    header_bytes.put_u8(frame.header.is_base() as u8);
    header_bytes.put_u8(frame.header.is_reply() as u8);
    header_bytes.put_u8(frame.header.is_system() as u8);
    header_bytes.put_u8(frame.header.is_backend() as u8);
    let from_bytes = frame.header.from().as_bytes();
    header_bytes.put_u8(from_bytes.len() as u8);
    header_bytes.put_slice(from_bytes);

    Ok([
        frame.to.clone().into_bytes(),
        frame.from.clone().into_bytes(),
        header_bytes.to_vec(),
        frame.body.clone(),
    ])
}

/// Parses the four ZMQ multipart parts back into a [`MeshFrame`].
pub fn decode_mesh_frame(parts: &[Vec<u8>]) -> Result<MeshFrame, CodecError> {
    let [to, from, header_bytes, body] = parts else {
        return Err(CodecError::UnexpectedEof);
    };

    let to = String::from_utf8(to.clone()).map_err(|_| CodecError::InvalidMsgIdEncoding)?;
    let from = String::from_utf8(from.clone()).map_err(|_| CodecError::InvalidMsgIdEncoding)?;

    let mut cursor = header_bytes.as_slice();
    if cursor.is_empty() {
        return Err(CodecError::UnexpectedEof);
    }
    let msg_id_len = cursor.get_u8() as usize;
    if msg_id_len == 0 || msg_id_len > MAX_MSG_ID_LEN || cursor.len() < msg_id_len {
        return Err(CodecError::MsgIdLengthOutOfRange {
            len: msg_id_len,
            max: MAX_MSG_ID_LEN,
        });
    }
    let msg_id = std::str::from_utf8(&cursor[..msg_id_len])
        .map_err(|_| CodecError::InvalidMsgIdEncoding)?
        .to_string();
    cursor.advance(msg_id_len);

    if cursor.len() < 2 + 8 + 2 + 4 {
        return Err(CodecError::UnexpectedEof);
    }
    let msg_seq = cursor.get_u16();
    let stage_id = cursor.get_i64();
    let error_code = cursor.get_u16();
    let is_base = cursor.get_u8() != 0;
    let is_reply = cursor.get_u8() != 0;
    let is_system = cursor.get_u8() != 0;
    let is_backend = cursor.get_u8() != 0;

    if cursor.is_empty() {
        return Err(CodecError::UnexpectedEof);
    }
    let from_field_len = cursor.get_u8() as usize;
    if cursor.len() < from_field_len {
        return Err(CodecError::UnexpectedEof);
    }
    let header_from = std::str::from_utf8(&cursor[..from_field_len])
        .map_err(|_| CodecError::InvalidMsgIdEncoding)?
        .to_string();

    let header = Header::new(msg_id, msg_seq, stage_id, error_code)
        .map_err(|_| CodecError::MsgIdLengthOutOfRange {
            len: msg_id_len,
            max: MAX_MSG_ID_LEN,
        })?
        .with_base(is_base)
        .with_reply(is_reply)
        .with_system(is_system)
        .with_backend(is_backend)
        .with_from(header_from);

    Ok(MeshFrame {
        to,
        from,
        header,
        body: body.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mesh_frame() {
        let header = Header::new("StageTimer", 0, 99, 0)
            .unwrap()
            .with_system(true)
            .with_from("play-1");
        let frame = MeshFrame::new("play-2", "play-1", header, b"hello".to_vec());
        let parts = encode_mesh_frame(&frame).unwrap();
        let decoded = decode_mesh_frame(&parts).unwrap();
        assert_eq!(decoded.to, "play-2");
        assert_eq!(decoded.from, "play-1");
        assert_eq!(decoded.header.msg_id(), "StageTimer");
        assert!(decoded.header.is_system());
        assert_eq!(decoded.header.from(), "play-1");
        assert_eq!(decoded.body, b"hello");
    }

    #[test]
    fn rejects_wrong_part_count() {
        let parts = vec![vec![1], vec![2]];
        assert!(decode_mesh_frame(&parts).is_err());
    }
}
