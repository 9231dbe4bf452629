//! Stage / StageSender + mailbox engine (C9, §4.9). Every stage gets one
//! long-lived tokio task that owns its `BaseStage` and drains an unbounded
//! mailbox one message at a time; the task only ever touches that one
//! stage's state, which is what gives user handlers lock-free access to
//! everything in `self` (§5 "Stage-internal state is mutated only on the
//! stage's own worker").

pub mod command;
pub mod game_loop;
pub mod timer;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use protocol::header::Header;
use protocol::msgids::{self, ErrorCode};
use protocol::packet::{ClientPacket, RoutePacket, SessionMeta};
use protocol::payload::Payload;

use crate::actor::{Actor, ActorBehavior, ActorState};
use crate::error::CoreError;
use crate::sender::{ReplyContext, Sender};

pub use command::StageCommandKind;
pub use game_loop::GameLoopHandle;
pub use timer::{TimerMode, TimerSet};

/// Wraps a `JoinStageRes`/`CreateJoinStageRes` reply payload with the
/// `accountId` the actor ended up bound to. A plain client never sees this
/// msg-id directly (the gateway in front of it translates the reply back
/// to the client's own `Auth`-style msg-id), so wrapping the reply body
/// here is invisible to user code the same way `JoinEnvelope` is invisible
/// on the request side.
#[derive(Debug, Serialize, Deserialize)]
pub struct JoinResultEnvelope {
    pub account_id: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Created,
    Running,
    Closed,
}

pub type UserHandlerFuture = Pin<Box<dyn Future<Output = (u16, Payload)> + Send>>;
pub type UserHandlerFn = Arc<dyn Fn(&mut Actor, ClientPacket, StageSender) -> UserHandlerFuture + Send + Sync>;
pub type ActorFactory = Arc<dyn Fn() -> Box<dyn ActorBehavior> + Send + Sync>;
pub type TickHandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type TimerHandlerFn = Arc<dyn Fn(u64, StageSender) -> TickHandlerFuture + Send + Sync>;
pub type GameLoopHandlerFn = Arc<dyn Fn(Duration, Duration, StageSender) -> TickHandlerFuture + Send + Sync>;

/// Messages a stage's mailbox accepts. Ordering between any two messages
/// posted to the same stage is preserved end to end (§8).
pub enum MailboxMessage {
    ClientUserMessage(RoutePacket),
    ServerUserMessage(RoutePacket),
    Join {
        account_id: String,
        session_nid: String,
        sid: u64,
        packet: ClientPacket,
        reply_to: Option<ReplyContext>,
    },
    Reconnect {
        account_id: String,
        session_nid: String,
        sid: u64,
        api_nid: Option<String>,
    },
    DisconnectNotice {
        account_id: String,
    },
    TimerTick {
        timer_id: u64,
    },
    GameLoopTick {
        delta: Duration,
        total_elapsed: Duration,
    },
    StartGameLoop {
        fixed_timestep: Duration,
        effective_cap: Duration,
    },
    StopGameLoop,
    StartTimer {
        initial_delay: Duration,
        mode: TimerMode,
        reply: tokio::sync::oneshot::Sender<u64>,
    },
    CancelTimer {
        id: u64,
        reply: tokio::sync::oneshot::Sender<bool>,
    },
    Destroy,
}

/// Handed to user handlers in place of a bare `Arc<Sender>` so stage control
/// operations (timers, game loop) go through the stage's own mailbox rather
/// than needing direct `&mut BaseStage` access from outside its worker task.
#[derive(Clone)]
pub struct StageSender {
    sender: Arc<Sender>,
    mailbox_tx: UnboundedSender<MailboxMessage>,
    stage_id: i64,
}

impl StageSender {
    pub fn sender(&self) -> &Arc<Sender> {
        &self.sender
    }

    pub fn stage_id(&self) -> i64 {
        self.stage_id
    }

    pub fn start_game_loop(&self, fixed_timestep: Duration, effective_cap: Duration) -> Result<(), CoreError> {
        self.mailbox_tx
            .send(MailboxMessage::StartGameLoop { fixed_timestep, effective_cap })
            .map_err(|_| CoreError::System(format!("stage {} mailbox closed", self.stage_id)))
    }

    pub fn stop_game_loop(&self) -> Result<(), CoreError> {
        self.mailbox_tx
            .send(MailboxMessage::StopGameLoop)
            .map_err(|_| CoreError::System(format!("stage {} mailbox closed", self.stage_id)))
    }

    pub async fn start_timer(&self, initial_delay: Duration, mode: TimerMode) -> Result<u64, CoreError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.mailbox_tx
            .send(MailboxMessage::StartTimer { initial_delay, mode, reply })
            .map_err(|_| CoreError::System(format!("stage {} mailbox closed", self.stage_id)))?;
        rx.await.map_err(|_| CoreError::System(format!("stage {} worker gone", self.stage_id)))
    }

    pub async fn cancel_timer(&self, id: u64) -> Result<bool, CoreError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.mailbox_tx
            .send(MailboxMessage::CancelTimer { id, reply })
            .map_err(|_| CoreError::System(format!("stage {} mailbox closed", self.stage_id)))?;
        rx.await.map_err(|_| CoreError::System(format!("stage {} worker gone", self.stage_id)))
    }
}

/// A lightweight reference to a running stage: just its mailbox sender.
/// Cloning is cheap; holding one does not keep the stage's worker task
/// alive (the task exits once every handle and the original sender are
/// dropped and the channel closes).
#[derive(Clone)]
pub struct StageHandle {
    pub stage_id: i64,
    pub stage_type: String,
    tx: UnboundedSender<MailboxMessage>,
}

impl StageHandle {
    pub fn post(&self, msg: MailboxMessage) -> Result<(), CoreError> {
        self.tx
            .send(msg)
            .map_err(|_| CoreError::System(format!("stage {} mailbox closed", self.stage_id)))
    }
}

/// Registered handlers for one stage type, built once at startup (§4.9,
/// §9 "Dynamic dispatch across commands": a handler map, not a class
/// hierarchy).
#[derive(Clone, Default)]
pub struct StageHandlers {
    pub user: HashMap<String, UserHandlerFn>,
    pub timer: Option<TimerHandlerFn>,
    pub game_loop: Option<GameLoopHandlerFn>,
}

pub struct BaseStage {
    stage_id: i64,
    stage_type: String,
    state: StageState,
    authenticate_msg_id: String,
    actors: HashMap<String, Actor>,
    behaviors: HashMap<String, Box<dyn ActorBehavior>>,
    actor_factory: ActorFactory,
    handlers: StageHandlers,
    sender: Arc<Sender>,
    timers: TimerSet,
    game_loop: Option<GameLoopHandle>,
    mailbox_tx: UnboundedSender<MailboxMessage>,
    closed_notify: UnboundedSender<i64>,
}

impl BaseStage {
    /// Spawns the stage's worker task and returns a handle to post
    /// messages to it.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        stage_id: i64,
        stage_type: impl Into<String>,
        authenticate_msg_id: impl Into<String>,
        actor_factory: ActorFactory,
        handlers: StageHandlers,
        sender: Arc<Sender>,
        closed_notify: UnboundedSender<i64>,
    ) -> StageHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let stage_type = stage_type.into();
        let stage = BaseStage {
            stage_id,
            stage_type: stage_type.clone(),
            state: StageState::Created,
            authenticate_msg_id: authenticate_msg_id.into(),
            actors: HashMap::new(),
            behaviors: HashMap::new(),
            actor_factory,
            handlers,
            sender,
            timers: TimerSet::new(),
            game_loop: None,
            mailbox_tx: tx.clone(),
            closed_notify,
        };
        tokio::spawn(run(stage, rx));
        StageHandle {
            stage_id,
            stage_type,
            tx,
        }
    }

    pub fn stage_id(&self) -> i64 {
        self.stage_id
    }

    fn stage_sender(&self) -> StageSender {
        StageSender {
            sender: self.sender.clone(),
            mailbox_tx: self.mailbox_tx.clone(),
            stage_id: self.stage_id,
        }
    }

    async fn handle(&mut self, msg: MailboxMessage) {
        self.state = StageState::Running;
        match msg {
            MailboxMessage::ClientUserMessage(route) | MailboxMessage::ServerUserMessage(route) => {
                self.handle_route(route).await;
            }
            MailboxMessage::Join {
                account_id,
                session_nid,
                sid,
                packet,
                reply_to,
            } => {
                self.handle_join(account_id, session_nid, sid, packet, reply_to).await;
            }
            MailboxMessage::Reconnect {
                account_id,
                session_nid,
                sid,
                api_nid,
            } => {
                self.handle_reconnect(account_id, session_nid, sid, api_nid).await;
            }
            MailboxMessage::DisconnectNotice { account_id } => {
                self.handle_disconnect_notice(account_id).await;
            }
            MailboxMessage::TimerTick { timer_id } => {
                if let Some(handler) = self.handlers.timer.clone() {
                    handler(timer_id, self.stage_sender()).await;
                }
            }
            MailboxMessage::GameLoopTick { delta, total_elapsed } => {
                if let Some(handler) = self.handlers.game_loop.clone() {
                    handler(delta, total_elapsed, self.stage_sender()).await;
                }
            }
            MailboxMessage::StartGameLoop { fixed_timestep, effective_cap } => {
                self.start_game_loop(fixed_timestep, effective_cap);
            }
            MailboxMessage::StopGameLoop => {
                self.stop_game_loop();
            }
            MailboxMessage::StartTimer { initial_delay, mode, reply } => {
                let id = self.timers.start(self.mailbox_tx.clone(), initial_delay, mode);
                let _ = reply.send(id);
            }
            MailboxMessage::CancelTimer { id, reply } => {
                let cancelled = self.timers.cancel(id);
                let _ = reply.send(cancelled);
            }
            MailboxMessage::Destroy => {
                self.handle_destroy().await;
            }
        }
    }

    async fn handle_route(&mut self, route: RoutePacket) {
        let (packet, from, _to, session) = route.into_client_packet();
        if packet.header.is_base() {
            self.handle_base_message(packet, from, session).await;
            return;
        }

        let Some(account_id) = session.account_id.clone() else {
            warn!(stage_id = self.stage_id, "dropped user message with no accountId");
            return;
        };
        self.dispatch_user_message(account_id, packet, from).await;
    }

    async fn handle_base_message(&mut self, packet: ClientPacket, from: String, session: SessionMeta) {
        match StageCommandKind::from_msg_id(packet.header.msg_id()) {
            Some(StageCommandKind::DestroyStage) => self.handle_destroy().await,
            Some(StageCommandKind::Reconnect) => {
                if let Some(account_id) = session.account_id {
                    self.handle_reconnect(
                        account_id,
                        session.session_nid.unwrap_or(from),
                        session.sid.unwrap_or(0),
                        None,
                    )
                    .await;
                }
            }
            Some(StageCommandKind::DisconnectNotice) => {
                if let Some(account_id) = session.account_id {
                    self.handle_disconnect_notice(account_id).await;
                }
            }
            // JoinStage/CreateStage/CreateJoinStage/GetOrCreateStage are
            // orchestrated by PlayDispatcher before anything reaches this
            // stage's mailbox; a base message still carrying one of those
            // msg-ids here means it bypassed the dispatcher somehow.
            _ => warn!(
                stage_id = self.stage_id,
                msg_id = packet.header.msg_id(),
                "unexpected base message delivered directly to stage mailbox"
            ),
        }
    }

    async fn dispatch_user_message(&mut self, account_id: String, packet: ClientPacket, from: String) {
        let msg_seq = packet.header.msg_seq();
        let stage_id = packet.header.stage_id();

        let Some(mut actor) = self.actors.remove(&account_id) else {
            warn!(stage_id = self.stage_id, account_id, "no actor for user message");
            if msg_seq != 0 {
                let _ = self.sender.reply(
                    &ReplyContext { to: from, msg_seq, stage_id },
                    packet.header.msg_id(),
                    ErrorCode::StageIsNotExist.code(),
                    Payload::empty(),
                );
            }
            return;
        };

        let msg_id = packet.header.msg_id().to_string();
        let stage_sender = self.stage_sender();
        let (error_code, reply_payload) = match self.handlers.user.get(&msg_id).cloned() {
            Some(handler) => handler(&mut actor, packet, stage_sender).await,
            None => {
                warn!(stage_id = self.stage_id, msg_id, "no handler registered");
                (ErrorCode::HandlerNotFound.code(), Payload::empty())
            }
        };
        self.actors.insert(account_id, actor);

        if msg_seq != 0 {
            let _ = self.sender.reply(
                &ReplyContext { to: from, msg_seq, stage_id },
                &msg_id,
                error_code,
                reply_payload,
            );
        }
    }

    async fn handle_join(
        &mut self,
        account_id: String,
        session_nid: String,
        sid: u64,
        packet: ClientPacket,
        reply_to: Option<ReplyContext>,
    ) {
        let mut actor = Actor::new(session_nid, sid);
        let mut behavior = (self.actor_factory)();
        behavior.on_create(&mut actor).await;

        let is_auth_packet = packet.header.msg_id() == self.authenticate_msg_id;
        let (ok, reply_payload) = if is_auth_packet {
            behavior.on_authenticate(&mut actor, &packet).await
        } else {
            (true, Payload::empty())
        };

        let ok = ok && (!is_auth_packet || !actor.account_id.is_empty());
        if !ok {
            if let Some(ctx) = reply_to {
                let _ = self.sender.reply(
                    &ctx,
                    msgids::MSG_JOIN_STAGE_RES,
                    ErrorCode::Unauthenticated.code(),
                    Payload::empty(),
                );
            }
            return;
        }
        if actor.account_id.is_empty() {
            actor.account_id = account_id.clone();
        }
        actor.state = ActorState::Authenticated;
        behavior.on_post_authenticate(&mut actor).await;
        actor.state = ActorState::Joined;

        let key = actor.account_id.clone();
        self.actors.insert(key.clone(), actor);
        self.behaviors.insert(key.clone(), behavior);

        if let Some(ctx) = reply_to {
            let envelope = JoinResultEnvelope { account_id: key, body: reply_payload.to_bytes().to_vec() };
            let wrapped = match serde_json::to_vec(&envelope) {
                Ok(bytes) => Payload::from_vec(bytes),
                Err(e) => {
                    warn!(error = %e, "failed to encode JoinResultEnvelope");
                    Payload::empty()
                }
            };
            let _ = self.sender.reply(&ctx, msgids::MSG_JOIN_STAGE_RES, 0, wrapped);
        }
    }

    async fn handle_reconnect(&mut self, account_id: String, session_nid: String, sid: u64, api_nid: Option<String>) {
        let Some(actor) = self.actors.get_mut(&account_id) else {
            debug!(stage_id = self.stage_id, account_id, "reconnect for unknown actor");
            return;
        };
        actor.rebind_session(session_nid, sid, api_nid);
        actor.state = ActorState::Joined;
        if let Some(behavior) = self.behaviors.get_mut(&account_id) {
            behavior.on_connection_changed(actor, true).await;
        }
    }

    async fn handle_disconnect_notice(&mut self, account_id: String) {
        let Some(actor) = self.actors.get_mut(&account_id) else {
            return;
        };
        actor.state = ActorState::Disconnected;
        if let Some(behavior) = self.behaviors.get_mut(&account_id) {
            behavior.on_connection_changed(actor, false).await;
        }
    }

    async fn handle_destroy(&mut self) {
        if self.state == StageState::Closed {
            return;
        }
        if let Some(mut loop_handle) = self.game_loop.take() {
            loop_handle.stop();
        }
        self.timers.cancel_all();
        for (account_id, mut actor) in self.actors.drain() {
            if let Some(mut behavior) = self.behaviors.remove(&account_id) {
                behavior.on_destroy(&mut actor).await;
            }
        }
        self.state = StageState::Closed;
        let _ = self.closed_notify.send(self.stage_id);
        info!(stage_id = self.stage_id, stage_type = self.stage_type, "stage destroyed");
    }

    /// Starts the stage's one allowed game loop. A second call replaces
    /// the previous loop (stopping it first) rather than stacking two.
    pub fn start_game_loop(&mut self, fixed_timestep: Duration, effective_cap: Duration) {
        if let Some(mut existing) = self.game_loop.take() {
            existing.stop();
        }
        self.game_loop = Some(GameLoopHandle::start(
            self.stage_id,
            self.mailbox_tx.clone(),
            fixed_timestep,
            effective_cap,
        ));
    }

    pub fn stop_game_loop(&mut self) {
        if let Some(mut handle) = self.game_loop.take() {
            handle.stop();
        }
    }

    pub fn start_timer(&self, initial_delay: Duration, mode: TimerMode) -> u64 {
        self.timers.start(self.mailbox_tx.clone(), initial_delay, mode)
    }

    pub fn cancel_timer(&self, id: u64) -> bool {
        self.timers.cancel(id)
    }
}

async fn run(mut stage: BaseStage, mut rx: UnboundedReceiver<MailboxMessage>) {
    while let Some(msg) = rx.recv().await {
        stage.handle(msg).await;
    }
    // Channel closed without an explicit Destroy (e.g. all handles
    // dropped): make sure resources still get released.
    stage.handle_destroy().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc as StdArc;

    use protocol::packet::SessionMeta;

    use crate::mesh::MeshSocket;
    use crate::request_cache::RequestCache;
    use crate::server_info::ServerInfoCenter;

    struct NoopBehavior;

    #[async_trait::async_trait]
    impl ActorBehavior for NoopBehavior {
        async fn on_create(&mut self, _actor: &mut Actor) {}
        async fn on_authenticate(&mut self, actor: &mut Actor, _packet: &ClientPacket) -> (bool, Payload) {
            actor.account_id = "u1".to_string();
            (true, Payload::empty())
        }
        async fn on_post_authenticate(&mut self, _actor: &mut Actor) {}
        async fn on_destroy(&mut self, _actor: &mut Actor) {}
        async fn on_connection_changed(&mut self, _actor: &mut Actor, _connected: bool) {}
    }

    fn test_sender(port: u16) -> Arc<Sender> {
        let mesh = MeshSocket::bind(format!("node-{port}"), &format!("tcp://127.0.0.1:{port}")).unwrap();
        let directory = StdArc::new(ServerInfoCenter::new(3));
        let cache = StdArc::new(RequestCache::new(Duration::from_secs(5)));
        Arc::new(Sender::new(format!("node-{port}"), mesh, directory, cache))
    }

    #[tokio::test]
    async fn ten_concurrent_increments_land_exactly_ten() {
        let counter = StdArc::new(AtomicI64::new(0));
        let counter_for_handler = counter.clone();

        let mut handlers = StageHandlers::default();
        handlers.user.insert(
            "Incr".to_string(),
            Arc::new(move |_actor, _packet, _sender| {
                let counter = counter_for_handler.clone();
                Box::pin(async move {
                    let current = counter.load(Ordering::Relaxed);
                    counter.store(current + 1, Ordering::Relaxed);
                    (0u16, Payload::empty())
                })
            }),
        );

        let sender = test_sender(28901);
        let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
        let handle = BaseStage::spawn(
            7,
            "test-stage",
            "Auth",
            Arc::new(|| Box::new(NoopBehavior)),
            handlers,
            sender.clone(),
            closed_tx,
        );

        let join_packet = ClientPacket::new(Header::new("Auth", 1, 7, 0).unwrap(), Payload::empty());
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        handle
            .post(MailboxMessage::Join {
                account_id: "u1".to_string(),
                session_nid: "gateway".to_string(),
                sid: 1,
                packet: join_packet,
                reply_to: None,
            })
            .unwrap();
        drop(reply_rx);
        drop(reply_tx);
        tokio::time::sleep(Duration::from_millis(20)).await;

        for k in 1..=10u16 {
            let header = Header::new("Incr", k, 7, 0).unwrap();
            let packet = ClientPacket::new(header, Payload::empty());
            let route = RoutePacket::new(packet.header, packet.payload, "gateway", "test-stage")
                .with_session(SessionMeta {
                    session_nid: Some("gateway".to_string()),
                    sid: Some(1),
                    account_id: Some("u1".to_string()),
                });
            handle.post(MailboxMessage::ClientUserMessage(route)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }
}
