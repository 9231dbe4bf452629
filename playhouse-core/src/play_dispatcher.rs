//! Stateful-server message routing (C10, §4.10). Owns the stage registry
//! and the control-plane commands that create, join, and destroy stages;
//! everything else it receives over the mesh either already belongs to a
//! running stage's mailbox or gets a `StageIsNotExist` reply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use protocol::msgids::{self, ErrorCode};
use protocol::packet::{ClientPacket, RoutePacket, SessionMeta};
use protocol::payload::Payload;

use crate::actor::ActorBehavior;
use crate::error::CoreError;
use crate::mesh::InboundMeshFrame;
use crate::sender::{ReplyContext, Sender};
use crate::stage::{ActorFactory, BaseStage, StageCommandKind, StageHandle, StageHandlers};
use crate::system_dispatcher::Pausable;

/// Join metadata that rides alongside the raw authenticate payload for any
/// control message that creates or attaches an actor. The wire framing
/// (`to`/`from`/header/body`) has no room for these fields, so control
/// bodies are a small JSON envelope instead of the opaque bytes a plain
/// user message carries.
#[derive(Debug, Serialize, Deserialize)]
pub struct JoinEnvelope {
    pub account_id: Option<String>,
    pub session_nid: String,
    pub sid: u64,
    /// The client's own msg-id for the join payload (e.g. "Auth"), carried
    /// separately from the control command's msg-id so `BaseStage` can
    /// still compare it against `authenticate_msg_id`.
    pub msg_id: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateStageEnvelope {
    pub stage_type: String,
    pub stage_key: Option<String>,
    pub join: Option<JoinEnvelope>,
}

/// Everything needed to spawn a new stage of one logical type, registered
/// once at bootstrap (§4.9).
#[derive(Clone)]
pub struct StageTypeDef {
    pub stage_type: String,
    pub authenticate_msg_id: String,
    pub actor_factory: ActorFactory,
    pub handlers: StageHandlers,
}

pub struct PlayDispatcher {
    sender: Arc<Sender>,
    stage_types: HashMap<String, StageTypeDef>,
    stages: Arc<Mutex<HashMap<i64, StageHandle>>>,
    keyed_stages: Mutex<HashMap<String, i64>>,
    next_stage_id: AtomicI64,
    closed_tx: mpsc::UnboundedSender<i64>,
    paused: AtomicBool,
}

impl PlayDispatcher {
    pub fn new(sender: Arc<Sender>, stage_types: Vec<StageTypeDef>) -> Arc<Self> {
        let stages = Arc::new(Mutex::new(HashMap::new()));
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<i64>();
        let reaper_stages = stages.clone();
        tokio::spawn(async move {
            while let Some(stage_id) = closed_rx.recv().await {
                reaper_stages.lock().expect("stages poisoned").remove(&stage_id);
            }
        });

        Arc::new(PlayDispatcher {
            sender,
            stage_types: stage_types.into_iter().map(|d| (d.stage_type.clone(), d)).collect(),
            stages,
            keyed_stages: Mutex::new(HashMap::new()),
            next_stage_id: AtomicI64::new(1),
            closed_tx,
            paused: AtomicBool::new(false),
        })
    }

    pub fn stage_count(&self) -> usize {
        self.stages.lock().expect("stages poisoned").len()
    }

    fn spawn_stage(&self, stage_type: &str) -> Result<StageHandle, CoreError> {
        let def = self
            .stage_types
            .get(stage_type)
            .ok_or_else(|| CoreError::System(format!("unknown stage type {stage_type}")))?;
        let stage_id = self.next_stage_id.fetch_add(1, Ordering::Relaxed);
        let handle = BaseStage::spawn(
            stage_id,
            def.stage_type.clone(),
            def.authenticate_msg_id.clone(),
            def.actor_factory.clone(),
            def.handlers.clone(),
            self.sender.clone(),
            self.closed_tx.clone(),
        );
        self.stages.lock().expect("stages poisoned").insert(stage_id, handle.clone());
        Ok(handle)
    }

    fn find_stage(&self, stage_id: i64) -> Option<StageHandle> {
        self.stages.lock().expect("stages poisoned").get(&stage_id).cloned()
    }

    /// Entry point for every inbound mesh frame that reached this far
    /// (i.e. wasn't a reply or a system message): control commands are
    /// handled here directly, everything else gets forwarded into the
    /// stage its `stageId` names.
    pub async fn route(&self, frame: InboundMeshFrame) {
        if self.paused.load(Ordering::Relaxed) {
            let msg_id = frame.header.msg_id().to_string();
            let msg_seq = frame.header.msg_seq();
            warn!(msg_id, "rejected inbound message, dispatcher is paused");
            if msg_seq != 0 {
                let _ = self.sender.reply(
                    &ReplyContext { to: frame.from.clone(), msg_seq, stage_id: frame.header.stage_id() },
                    &msg_id,
                    ErrorCode::SystemError.code(),
                    Payload::empty(),
                );
            }
            return;
        }
        if frame.header.is_base() {
            if let Some(kind) = StageCommandKind::from_msg_id(frame.header.msg_id()) {
                self.handle_command(kind, frame).await;
                return;
            }
        }
        self.route_to_stage(frame);
    }

    /// Entry point for a gateway forwarding an already-authenticated
    /// client's message in-process. Unlike [`PlayDispatcher::route`], the
    /// caller already knows the session's `accountId` (it was set the
    /// moment the client joined), so there is no need to round-trip it
    /// through a wire envelope the way [`JoinEnvelope`] does for joins:
    /// the gateway just hands it over directly.
    pub fn post_client_message(
        &self,
        stage_id: i64,
        session_nid: String,
        sid: u64,
        account_id: String,
        header: protocol::header::Header,
        payload: Payload,
        reply_to: Option<ReplyContext>,
    ) -> Result<(), CoreError> {
        let msg_id = header.msg_id().to_string();
        let Some(handle) = self.find_stage(stage_id) else {
            if let Some(ctx) = reply_to {
                let _ = self.sender.reply(&ctx, &msg_id, ErrorCode::StageIsNotExist.code(), Payload::empty());
            }
            return Err(CoreError::StageNotExist(stage_id));
        };
        let session = SessionMeta {
            session_nid: Some(session_nid.clone()),
            sid: Some(sid),
            account_id: Some(account_id),
        };
        let route = RoutePacket::new(header, payload, session_nid, self.sender.server_id().to_string()).with_session(session);
        handle.post(crate::stage::MailboxMessage::ClientUserMessage(route))
    }

    /// Entry point for a gateway reconnecting a session to an actor that
    /// already exists in a running stage, bypassing the generic
    /// [`StageCommandKind::Reconnect`] wire path the same way
    /// [`PlayDispatcher::post_client_message`] bypasses
    /// [`PlayDispatcher::route_to_stage`]: the gateway already knows the
    /// `accountId` the client is reconnecting as (it came from the
    /// client's own reconnect payload), so there is nothing to recover
    /// from a wire envelope.
    pub fn notify_reconnect(
        &self,
        stage_id: i64,
        account_id: String,
        session_nid: String,
        sid: u64,
        api_nid: Option<String>,
    ) -> Result<(), CoreError> {
        let Some(handle) = self.find_stage(stage_id) else {
            return Err(CoreError::StageNotExist(stage_id));
        };
        handle.post(crate::stage::MailboxMessage::Reconnect { account_id, session_nid, sid, api_nid })
    }

    /// Entry point for a gateway notifying a stage that a session has
    /// disconnected, used by the transport layer when a client's
    /// connection closes after it had joined a stage.
    pub fn notify_disconnect(&self, stage_id: i64, account_id: String) -> Result<(), CoreError> {
        let Some(handle) = self.find_stage(stage_id) else {
            return Err(CoreError::StageNotExist(stage_id));
        };
        handle.post(crate::stage::MailboxMessage::DisconnectNotice { account_id })
    }

    fn route_to_stage(&self, frame: InboundMeshFrame) {
        let stage_id = frame.header.stage_id();
        let msg_seq = frame.header.msg_seq();
        let msg_id = frame.header.msg_id().to_string();
        let Some(handle) = self.find_stage(stage_id) else {
            warn!(stage_id, msg_id, "no stage for inbound message");
            if msg_seq != 0 {
                let _ = self.sender.reply(
                    &ReplyContext { to: frame.from.clone(), msg_seq, stage_id },
                    &msg_id,
                    ErrorCode::StageIsNotExist.code(),
                    Payload::empty(),
                );
            }
            return;
        };
        let session = SessionMeta { session_nid: None, sid: None, account_id: None };
        let route = RoutePacket::new(frame.header, frame.payload, frame.from, frame.to).with_session(session);
        let _ = handle.post(crate::stage::MailboxMessage::ServerUserMessage(route));
    }

    async fn handle_command(&self, kind: StageCommandKind, frame: InboundMeshFrame) {
        match kind {
            StageCommandKind::CreateStage => self.handle_create_stage(frame, false).await,
            StageCommandKind::CreateJoinStage => self.handle_create_stage(frame, true).await,
            StageCommandKind::GetOrCreateStage => self.handle_get_or_create_stage(frame).await,
            StageCommandKind::JoinStage => self.handle_join_stage(frame).await,
            StageCommandKind::DestroyStage => {
                if let Some(handle) = self.find_stage(frame.header.stage_id()) {
                    let _ = handle.post(crate::stage::MailboxMessage::Destroy);
                }
            }
            StageCommandKind::Reconnect | StageCommandKind::DisconnectNotice => {
                self.route_to_stage(frame);
            }
        }
    }

    async fn handle_create_stage(&self, frame: InboundMeshFrame, with_join: bool) {
        let msg_seq = frame.header.msg_seq();
        let reply_msg_id = if with_join {
            msgids::MSG_CREATE_JOIN_STAGE_RES
        } else {
            msgids::MSG_CREATE_STAGE_RES
        };
        let envelope: CreateStageEnvelope = match serde_json::from_slice(frame.payload.span()) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "malformed CreateStage envelope");
                return;
            }
        };

        let handle = match self.spawn_stage(&envelope.stage_type) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e.to_string(), "failed to create stage");
                if msg_seq != 0 {
                    let _ = self.sender.reply(
                        &ReplyContext { to: frame.from.clone(), msg_seq, stage_id: 0 },
                        reply_msg_id,
                        e.to_error_code().code(),
                        Payload::empty(),
                    );
                }
                return;
            }
        };

        if with_join {
            if let Some(join) = envelope.join {
                let auth_header = match protocol::header::Header::new(join.msg_id.clone(), 0, handle.stage_id, 0) {
                    Ok(h) => h,
                    Err(e) => {
                        warn!(error = %e, "malformed join msg-id in CreateJoinStage envelope");
                        return;
                    }
                };
                let packet = ClientPacket::new(auth_header, Payload::from_vec(join.body));
                let reply_to = if msg_seq != 0 {
                    Some(ReplyContext { to: frame.from.clone(), msg_seq, stage_id: handle.stage_id })
                } else {
                    None
                };
                let _ = handle.post(crate::stage::MailboxMessage::Join {
                    account_id: join.account_id.unwrap_or_default(),
                    session_nid: join.session_nid,
                    sid: join.sid,
                    packet,
                    reply_to,
                });
                return;
            }
        }

        if msg_seq != 0 {
            let _ = self.sender.reply(
                &ReplyContext { to: frame.from, msg_seq, stage_id: handle.stage_id },
                reply_msg_id,
                0,
                Payload::empty(),
            );
        }
    }

    async fn handle_get_or_create_stage(&self, frame: InboundMeshFrame) {
        let msg_seq = frame.header.msg_seq();
        let envelope: CreateStageEnvelope = match serde_json::from_slice(frame.payload.span()) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "malformed GetOrCreateStage envelope");
                return;
            }
        };
        let Some(stage_key) = envelope.stage_key.clone() else {
            warn!("GetOrCreateStage requires a stageKey");
            return;
        };

        let existing = self.keyed_stages.lock().expect("keyed stages poisoned").get(&stage_key).copied();
        let stage_id = if let Some(id) = existing {
            id
        } else {
            match self.spawn_stage(&envelope.stage_type) {
                Ok(handle) => {
                    self.keyed_stages
                        .lock()
                        .expect("keyed stages poisoned")
                        .insert(stage_key, handle.stage_id);
                    handle.stage_id
                }
                Err(e) => {
                    warn!(error = %e.to_string(), "failed to create stage");
                    return;
                }
            }
        };

        if msg_seq != 0 {
            let _ = self.sender.reply(
                &ReplyContext { to: frame.from, msg_seq, stage_id },
                msgids::MSG_GET_OR_CREATE_STAGE_RES,
                0,
                Payload::empty(),
            );
        }
    }

    async fn handle_join_stage(&self, frame: InboundMeshFrame) {
        let msg_seq = frame.header.msg_seq();
        let stage_id = frame.header.stage_id();
        let Some(handle) = self.find_stage(stage_id) else {
            if msg_seq != 0 {
                let _ = self.sender.reply(
                    &ReplyContext { to: frame.from.clone(), msg_seq, stage_id },
                    msgids::MSG_JOIN_STAGE_RES,
                    ErrorCode::StageIsNotExist.code(),
                    Payload::empty(),
                );
            }
            return;
        };
        let join: JoinEnvelope = match serde_json::from_slice(frame.payload.span()) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "malformed JoinStage envelope");
                return;
            }
        };
        let auth_header = match protocol::header::Header::new(join.msg_id.clone(), 0, stage_id, 0) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "malformed join msg-id in JoinStage envelope");
                return;
            }
        };
        let packet = ClientPacket::new(auth_header, Payload::from_vec(join.body));
        let reply_to = if msg_seq != 0 {
            Some(ReplyContext { to: frame.from, msg_seq, stage_id })
        } else {
            None
        };
        let _ = handle.post(crate::stage::MailboxMessage::Join {
            account_id: join.account_id.unwrap_or_default(),
            session_nid: join.session_nid,
            sid: join.sid,
            packet,
            reply_to,
        });
    }
}

impl Pausable for PlayDispatcher {
    fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }
}

/// Convenience constructor for a [`StageTypeDef`] from a plain closure
/// factory, used by server bootstrap code to register a stage type.
pub fn stage_type(
    stage_type: impl Into<String>,
    authenticate_msg_id: impl Into<String>,
    actor_factory: impl Fn() -> Box<dyn ActorBehavior> + Send + Sync + 'static,
    handlers: StageHandlers,
) -> StageTypeDef {
    StageTypeDef {
        stage_type: stage_type.into(),
        authenticate_msg_id: authenticate_msg_id.into(),
        actor_factory: Arc::new(actor_factory),
        handlers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use protocol::header::Header;

    use crate::mesh::MeshSocket;
    use crate::request_cache::RequestCache;
    use crate::server_info::ServerInfoCenter;
    use crate::stage::StageHandlers;

    struct NoopBehavior;

    #[async_trait::async_trait]
    impl ActorBehavior for NoopBehavior {
        async fn on_create(&mut self, _actor: &mut crate::actor::Actor) {}
        async fn on_authenticate(&mut self, actor: &mut crate::actor::Actor, _packet: &ClientPacket) -> (bool, Payload) {
            actor.account_id = "u1".to_string();
            (true, Payload::empty())
        }
        async fn on_post_authenticate(&mut self, _actor: &mut crate::actor::Actor) {}
        async fn on_destroy(&mut self, _actor: &mut crate::actor::Actor) {}
        async fn on_connection_changed(&mut self, _actor: &mut crate::actor::Actor, _connected: bool) {}
    }

    fn test_sender(port: u16) -> Arc<Sender> {
        let mesh = MeshSocket::bind(format!("node-{port}"), &format!("tcp://127.0.0.1:{port}")).unwrap();
        let directory = Arc::new(ServerInfoCenter::new(3));
        let cache = Arc::new(RequestCache::new(Duration::from_secs(5)));
        Arc::new(Sender::new(format!("node-{port}"), mesh, directory, cache))
    }

    #[tokio::test]
    async fn create_stage_command_spawns_and_replies() {
        let sender = test_sender(28911);
        let dispatcher = PlayDispatcher::new(
            sender,
            vec![stage_type("room", "Auth", || Box::new(NoopBehavior), StageHandlers::default())],
        );

        let envelope = CreateStageEnvelope { stage_type: "room".to_string(), stage_key: None, join: None };
        let header = Header::new(msgids::MSG_CREATE_STAGE_REQ, 0, 0, 0)
            .unwrap()
            .with_base(true)
            .with_from("gateway-1");
        let frame = InboundMeshFrame {
            from: "gateway-1".to_string(),
            to: "play-1".to_string(),
            header,
            payload: Payload::from_vec(serde_json::to_vec(&envelope).unwrap()),
        };
        dispatcher.route(frame).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.stage_count(), 1);
    }
}
