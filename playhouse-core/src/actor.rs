//! Actor & ActorSender (C8, §4.8). An actor is owned exclusively by one
//! stage and scheduled only on that stage's mailbox worker, so its fields
//! need no internal synchronization — the mailbox's mutual exclusion is
//! the only lock that matters.

use std::sync::Arc;

use async_trait::async_trait;

use protocol::header::Header;
use protocol::msgids;
use protocol::packet::ClientPacket;
use protocol::payload::Payload;
use protocol::push::ClientPushEnvelope;

use crate::error::CoreError;
use crate::sender::Sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Created,
    Authenticated,
    Joined,
    Disconnected,
    Destroyed,
}

/// Per-client identity and connection binding, owned by the stage it has
/// joined (§3 "Actor").
pub struct Actor {
    pub account_id: String,
    pub session_nid: String,
    pub sid: u64,
    pub api_nid: Option<String>,
    pub state: ActorState,
}

impl Actor {
    pub fn new(session_nid: impl Into<String>, sid: u64) -> Self {
        Actor {
            account_id: String::new(),
            session_nid: session_nid.into(),
            sid,
            api_nid: None,
            state: ActorState::Created,
        }
    }

    /// Rebinds the actor to a new session after a reconnect (§4.9
    /// "Reconnect"), preserving every other piece of in-stage state.
    pub fn rebind_session(&mut self, session_nid: impl Into<String>, sid: u64, api_nid: Option<String>) {
        self.session_nid = session_nid.into();
        self.sid = sid;
        self.api_nid = api_nid;
    }
}

/// `ActorSender.SendToClient` routes pushes through the actor's owning
/// session server (a mesh peer), never through a local TCP write, so
/// gateway topologies (where the Play server and the client's TCP session
/// live on different processes) work the same as a collapsed topology.
pub struct ActorSender {
    sender: Arc<Sender>,
    session_nid: String,
    sid: u64,
}

impl ActorSender {
    pub fn new(sender: Arc<Sender>, session_nid: impl Into<String>, sid: u64) -> Self {
        ActorSender {
            sender,
            session_nid: session_nid.into(),
            sid,
        }
    }

    pub fn for_actor(sender: Arc<Sender>, actor: &Actor) -> Self {
        ActorSender::new(sender, actor.session_nid.clone(), actor.sid)
    }

    /// Wraps `msg_id`/`error_code`/`payload` in a [`ClientPushEnvelope`]
    /// addressed to `self.sid` and routes it to `self.session_nid`, the
    /// mesh peer that owns the live TCP/WS session — never a local write,
    /// so this works the same whether the session lives on this process or
    /// a separate gateway.
    pub fn send_to_client(&self, msg_id: &str, error_code: u16, payload: Payload) -> Result<(), CoreError> {
        let envelope = ClientPushEnvelope {
            sid: self.sid,
            msg_id: msg_id.to_string(),
            error_code,
            body: payload.to_bytes().to_vec(),
        };
        let body = serde_json::to_vec(&envelope).map_err(|e| CoreError::System(e.to_string()))?;
        let header = Header::new(msgids::MSG_SEND_TO_CLIENT.to_string(), 0, 0, 0)?
            .with_base(true)
            .with_from(self.sender.server_id().to_string());
        self.sender.mesh().send(self.session_nid.clone(), header, body)
    }

    pub fn sid(&self) -> u64 {
        self.sid
    }
}

/// User-implemented actor lifecycle (§4.8). `on_authenticate` must set
/// `actor.account_id` before returning `true`; a `true` result with an
/// empty `account_id` is a handler bug, not a framework-enforced
/// invariant, so it's left to the caller (`PlayDispatcher`) to treat an
/// empty `account_id` on success as an authentication failure.
#[async_trait]
pub trait ActorBehavior: Send + Sync {
    async fn on_create(&mut self, actor: &mut Actor);

    async fn on_authenticate(&mut self, actor: &mut Actor, packet: &ClientPacket) -> (bool, Payload);

    async fn on_post_authenticate(&mut self, actor: &mut Actor);

    async fn on_destroy(&mut self, actor: &mut Actor);

    /// Fired on reconnect (`connected = true`) and on disconnect notice
    /// (`connected = false`); the actor instance is unchanged across both.
    async fn on_connection_changed(&mut self, actor: &mut Actor, connected: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebind_session_preserves_account_id() {
        let mut actor = Actor::new("gateway-1", 7);
        actor.account_id = "u1".to_string();
        actor.state = ActorState::Joined;
        actor.rebind_session("gateway-2", 99, Some("api-1".to_string()));
        assert_eq!(actor.account_id, "u1");
        assert_eq!(actor.session_nid, "gateway-2");
        assert_eq!(actor.sid, 99);
        assert_eq!(actor.state, ActorState::Joined);
    }
}
