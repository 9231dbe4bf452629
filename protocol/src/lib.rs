//! Wire format and shared data model for PlayHouse: the packet header,
//! pooled buffers and payload ownership, the client frame codec, the
//! inter-server mesh frame, and the message-id/error-code constants every
//! other crate in the workspace builds on.

pub mod codec;
pub mod error;
pub mod header;
pub mod mesh_frame;
pub mod msgids;
pub mod packet;
pub mod payload;
pub mod pool;
pub mod push;

pub use codec::{decode_client_frame, encode_client_frame, validate_len, LENGTH_PREFIX_BYTES};
pub use error::{CodecError, ModelError};
pub use header::{Header, HeaderPool};
pub use mesh_frame::{decode_mesh_frame, encode_mesh_frame, MeshFrame};
pub use msgids::ErrorCode;
pub use packet::{ClientPacket, RoutePacket, SessionMeta};
pub use payload::Payload;
pub use pool::{BufferPool, PoolConfig, PooledBuffer};
pub use push::ClientPushEnvelope;
