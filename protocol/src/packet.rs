//! Packet = Header + Payload (§3). Client packets carry no routing
//! metadata; route packets additionally carry `from`/`to` server-ids and
//! optional session metadata.

use crate::header::Header;
use crate::payload::Payload;

/// A packet as seen by client-facing code: header plus payload, nothing
/// else. Disposing a `ClientPacket` disposes its payload.
pub struct ClientPacket {
    pub header: Header,
    pub payload: Payload,
}

impl ClientPacket {
    pub fn new(header: Header, payload: Payload) -> Self {
        ClientPacket { header, payload }
    }

    pub fn dispose(&mut self) {
        self.payload.dispose();
    }
}

/// Session metadata carried by a route packet when it concerns a specific
/// client session (e.g. `SendToClient`, reconnect/disconnect notices).
#[derive(Debug, Clone, Default)]
pub struct SessionMeta {
    /// The server-id of the session's owning gateway/Play server.
    pub session_nid: Option<String>,
    /// The session id on that server.
    pub sid: Option<u64>,
    /// The authenticated account id, once known.
    pub account_id: Option<String>,
}

/// Inter-server packet: a `ClientPacket` plus the mesh addressing needed
/// to route and attribute it. A route packet owns its payload.
pub struct RoutePacket {
    pub header: Header,
    pub payload: Payload,
    pub from: String,
    pub to: String,
    pub session: SessionMeta,
}

impl RoutePacket {
    pub fn new(header: Header, payload: Payload, from: impl Into<String>, to: impl Into<String>) -> Self {
        RoutePacket {
            header,
            payload,
            from: from.into(),
            to: to.into(),
            session: SessionMeta::default(),
        }
    }

    pub fn with_session(mut self, session: SessionMeta) -> Self {
        self.session = session;
        self
    }

    pub fn dispose(&mut self) {
        self.payload.dispose();
    }

    /// Splits the packet into a plain client packet (for handing to user
    /// code/dispatch) and the routing envelope, without copying the
    /// payload.
    pub fn into_client_packet(self) -> (ClientPacket, String, String, SessionMeta) {
        (
            ClientPacket {
                header: self.header,
                payload: self.payload,
            },
            self.from,
            self.to,
            self.session,
        )
    }
}
