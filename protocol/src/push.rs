//! Envelope for a server-to-client push that crosses a mesh hop
//! (`ActorSender::send_to_client` in `playhouse-core`). The outer mesh
//! header only carries a destination server-id; the specific client
//! session on that gateway is identified by `sid` here, the same way
//! `JoinEnvelope` carries session metadata the wire header has no room for.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ClientPushEnvelope {
    pub sid: u64,
    pub msg_id: String,
    pub error_code: u16,
    pub body: Vec<u8>,
}
