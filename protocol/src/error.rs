//! Errors shared by the wire codec and the data model.

use thiserror::Error;

/// Errors raised while encoding or decoding a frame.
///
/// Every variant here corresponds to a hard bound from §4.2. Any of these
/// failing the connection with a protocol error is the caller's
/// responsibility (see `playhouse-server::session`); this crate only
/// classifies the violation.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame length {len} outside of allowed range [1, {max}]")]
    FrameLengthOutOfRange { len: usize, max: usize },

    #[error("msgId length {len} outside of allowed range [1, {max}]")]
    MsgIdLengthOutOfRange { len: usize, max: usize },

    #[error("header total {header_total} exceeds frame length {len}")]
    HeaderExceedsFrame { header_total: usize, len: usize },

    #[error("decompressed original size {original_size} exceeds maximum {max}")]
    OriginalSizeOutOfRange { original_size: usize, max: usize },

    #[error("decompressed length {actual} did not match originalSize {expected}")]
    DecompressedLengthMismatch { expected: usize, actual: usize },

    #[error("msgId was not valid UTF-8")]
    InvalidMsgIdEncoding,

    #[error("unexpected end of buffer while decoding a frame")]
    UnexpectedEof,

    #[error("lz4 compression failure: {0}")]
    Compression(String),
}

/// Errors raised constructing or validating data-model values (headers,
/// payload ownership violations).
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("msgId {0:?} exceeds the maximum length of {1} bytes")]
    MsgIdTooLong(String, usize),

    #[error("msgId must not be empty")]
    MsgIdEmpty,

    #[error("payload already moved or disposed")]
    PayloadAlreadyMoved,
}
