//! Client-facing gateway: the session registry and the in-process bridge
//! from a decoded client frame to `PlayDispatcher`/`ApiDispatcher` (C3 +
//! C10/C12, §4.3, §4.10, §4.12).
//!
//! A gateway never ships a client's request out over the wire as-is. It
//! calls straight into the dispatcher the way a peer server's inbound mesh
//! frame would, after allocating a fresh request-cache sequence number —
//! the client's own `msgSeq` only has meaning between the client and this
//! gateway, and two different sessions are free to reuse the same value at
//! the same time. The dispatcher's eventual `Sender::reply` still goes out
//! over a real, self-connected mesh loopback, so the completion path is
//! the same one used for genuine server-to-server requests (C4).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::warn;

use playhouse_core::mesh::InboundMeshFrame;
use playhouse_core::play_dispatcher::{CreateStageEnvelope, JoinEnvelope};
use playhouse_core::request_cache::RequestOutcome;
use playhouse_core::sender::ReplyContext;
use playhouse_core::stage::JoinResultEnvelope;
use playhouse_core::system_dispatcher::Pausable;
use playhouse_core::{ApiDispatcher, PlayDispatcher, PlayHouseConfig, Sender};
use protocol::header::Header;
use protocol::msgids::{self, ErrorCode};
use protocol::payload::Payload;
use protocol::{encode_client_frame, ClientPushEnvelope};

/// Which dispatcher a gateway forwards client traffic into. One process
/// runs exactly one of these (§4.10 vs §4.12 are mutually exclusive roles).
pub enum DispatchTarget {
    Play(Arc<PlayDispatcher>),
    Api(Arc<ApiDispatcher>),
}

impl Pausable for DispatchTarget {
    fn pause(&self) {
        match self {
            DispatchTarget::Play(play) => play.pause(),
            DispatchTarget::Api(api) => api.pause(),
        }
    }

    fn resume(&self) {
        match self {
            DispatchTarget::Play(play) => play.resume(),
            DispatchTarget::Api(api) => api.resume(),
        }
    }

    fn is_paused(&self) -> bool {
        match self {
            DispatchTarget::Play(play) => play.is_paused(),
            DispatchTarget::Api(api) => api.is_paused(),
        }
    }
}

/// Client-facing reconnect payload: names the account a previously joined
/// session wants to resume as. The stage to reconnect into is read off the
/// frame's own `stageId`, not this body.
#[derive(serde::Deserialize)]
struct ReconnectEnvelope {
    account_id: String,
}

/// One live client session. Not yet joined to a stage means `stage_id`
/// holds `NOT_JOINED`.
pub struct GatewaySession {
    pub sid: u64,
    account_id: Mutex<Option<String>>,
    stage_id: AtomicI64,
    outbound: tokio::sync::mpsc::UnboundedSender<Bytes>,
}

const NOT_JOINED: i64 = -1;

impl GatewaySession {
    pub fn is_joined(&self) -> bool {
        self.stage_id.load(Ordering::Acquire) != NOT_JOINED
    }

    pub fn stage_id(&self) -> Option<i64> {
        match self.stage_id.load(Ordering::Acquire) {
            NOT_JOINED => None,
            id => Some(id),
        }
    }

    pub fn account_id(&self) -> Option<String> {
        self.account_id.lock().expect("session poisoned").clone()
    }

    fn bind(&self, stage_id: i64, account_id: String) {
        *self.account_id.lock().expect("session poisoned") = Some(account_id);
        self.stage_id.store(stage_id, Ordering::Release);
    }

    /// Queues an already-encoded frame for delivery to this session's
    /// transport write half. A closed outbound channel means the
    /// connection is already gone; the caller has nothing further to do.
    pub fn push(&self, bytes: Bytes) {
        let _ = self.outbound.send(bytes);
    }
}

/// Maps live session ids to their session state, and hands out a fresh sid
/// to every newly accepted connection.
pub struct SessionRegistry {
    sessions: Mutex<std::collections::HashMap<u64, Arc<GatewaySession>>>,
    next_sid: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(SessionRegistry {
            sessions: Mutex::new(std::collections::HashMap::new()),
            next_sid: AtomicU64::new(1),
        })
    }

    pub fn register(&self, outbound: tokio::sync::mpsc::UnboundedSender<Bytes>) -> Arc<GatewaySession> {
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(GatewaySession {
            sid,
            account_id: Mutex::new(None),
            stage_id: AtomicI64::new(NOT_JOINED),
            outbound,
        });
        self.sessions.lock().expect("registry poisoned").insert(sid, session.clone());
        session
    }

    pub fn unregister(&self, sid: u64) {
        self.sessions.lock().expect("registry poisoned").remove(&sid);
    }

    pub fn get(&self, sid: u64) -> Option<Arc<GatewaySession>> {
        self.sessions.lock().expect("registry poisoned").get(&sid).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("registry poisoned").len()
    }

    /// Handles an inbound `SendToClient` push: decodes the envelope and
    /// hands the encoded client frame to the named session's outbound
    /// queue, if that session still lives here.
    pub fn deliver_push(&self, body: &[u8], compression_threshold: usize, max_packet_bytes: usize) {
        let envelope: ClientPushEnvelope = match serde_json::from_slice(body) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "malformed ClientPushEnvelope");
                return;
            }
        };
        let Some(session) = self.get(envelope.sid) else {
            warn!(sid = envelope.sid, "push for unknown session, dropped");
            return;
        };
        let header = match Header::new(envelope.msg_id, 0, 0, envelope.error_code) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "invalid msgId in ClientPushEnvelope");
                return;
            }
        };
        match encode_client_frame(&header, &envelope.body, compression_threshold, max_packet_bytes) {
            Ok(frame) => session.push(frame.freeze()),
            Err(e) => warn!(error = %e, "failed to encode push frame"),
        }
    }
}

/// Bundles everything a connection handler needs to turn decoded client
/// frames into dispatcher calls and dispatcher replies back into encoded
/// client frames.
#[derive(Clone)]
pub struct GatewayContext {
    pub config: Arc<PlayHouseConfig>,
    pub sender: Arc<Sender>,
    pub target: Arc<DispatchTarget>,
}

impl GatewayContext {
    /// Routes one decoded client frame. Never blocks on the eventual
    /// reply: if the client expects one (`msgSeq != 0`), a task is spawned
    /// to await it and push the encoded reply frame once it resolves.
    pub async fn handle_frame(&self, session: &Arc<GatewaySession>, header: Header, payload: Payload) {
        let client_msg_id = header.msg_id().to_string();
        let client_msg_seq = header.msg_seq();
        let client_stage_id = header.stage_id();

        match self.target.as_ref() {
            DispatchTarget::Api(api) => {
                let registration = (client_msg_seq != 0).then(|| self.sender.request_cache().register(Some(self.config.request_timeout())));
                let forwarded_seq = registration.as_ref().map(|(seq, _)| *seq).unwrap_or(0);
                let forwarded = Header::new(client_msg_id.clone(), forwarded_seq, client_stage_id, 0)
                    .expect("msgId already validated by the wire codec")
                    .with_from(self.sender.server_id().to_string());
                let frame = InboundMeshFrame {
                    from: self.sender.server_id().to_string(),
                    to: self.sender.server_id().to_string(),
                    header: forwarded,
                    payload,
                };
                api.route(frame);
                if let Some((_, rx)) = registration {
                    self.spawn_awaiter(session.clone(), client_msg_id, client_msg_seq, rx);
                }
                return;
            }
            DispatchTarget::Play(play) => {
                if let Some(stage_id) = session.stage_id() {
                    self.forward_to_stage(play, session, stage_id, client_msg_id, client_msg_seq, header, payload).await;
                } else if client_msg_id == msgids::MSG_RECONNECT {
                    self.handle_reconnect_request(play, session, client_msg_id, client_msg_seq, client_stage_id, payload).await;
                } else {
                    self.forward_join(play, session, client_msg_id, client_msg_seq, payload).await;
                }
            }
        }
    }

    /// A session that lost its connection and comes back presents a
    /// `ReconnectMsg` naming the stage and account it was bound to, rather
    /// than going through the create/join flow again.
    async fn handle_reconnect_request(
        &self,
        play: &Arc<PlayDispatcher>,
        session: &Arc<GatewaySession>,
        client_msg_id: String,
        client_msg_seq: u16,
        stage_id: i64,
        payload: Payload,
    ) {
        let envelope: ReconnectEnvelope = match serde_json::from_slice(payload.span()) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "malformed reconnect payload");
                if client_msg_seq != 0 {
                    self.reply_error_to_client(session, &client_msg_id, client_msg_seq, ErrorCode::UncheckedContentsError.code());
                }
                return;
            }
        };
        match play.notify_reconnect(stage_id, envelope.account_id.clone(), self.sender.server_id().to_string(), session.sid, None) {
            Ok(()) => {
                session.bind(stage_id, envelope.account_id);
                if client_msg_seq != 0 {
                    self.reply_error_to_client(session, &client_msg_id, client_msg_seq, 0);
                }
            }
            Err(e) => {
                warn!(error = %e, stage_id, "reconnect failed");
                if client_msg_seq != 0 {
                    self.reply_error_to_client(session, &client_msg_id, client_msg_seq, e.to_error_code().code());
                }
            }
        }
    }

    /// Notifies the owning stage that this session's connection closed, so
    /// `on_connection_changed(false)` fires the same way it would for a
    /// peer-originated disconnect notice. A no-op for sessions that never
    /// joined a stage, and for Api-role gateways (no stage concept there).
    pub fn notify_disconnect(&self, session: &Arc<GatewaySession>) {
        let DispatchTarget::Play(play) = self.target.as_ref() else {
            return;
        };
        if let (Some(stage_id), Some(account_id)) = (session.stage_id(), session.account_id())
            && let Err(e) = play.notify_disconnect(stage_id, account_id)
        {
            warn!(error = %e, stage_id, "failed to notify stage of disconnect");
        }
    }

    async fn forward_to_stage(
        &self,
        play: &Arc<PlayDispatcher>,
        session: &Arc<GatewaySession>,
        stage_id: i64,
        client_msg_id: String,
        client_msg_seq: u16,
        header: Header,
        payload: Payload,
    ) {
        let Some(account_id) = session.account_id() else {
            warn!(sid = session.sid, "forwarding user message for a session with no accountId yet");
            return;
        };
        let registration = (client_msg_seq != 0).then(|| self.sender.request_cache().register(Some(self.config.request_timeout())));
        let forwarded_seq = registration.as_ref().map(|(seq, _)| *seq).unwrap_or(0);
        let reply_to = registration.as_ref().map(|(seq, _)| ReplyContext {
            to: self.sender.server_id().to_string(),
            msg_seq: *seq,
            stage_id,
        });
        let forwarded_header = Header::new(header.msg_id().to_string(), forwarded_seq, stage_id, 0)
            .expect("msgId already validated by the wire codec")
            .with_from(self.sender.server_id().to_string());

        if let Err(e) = play.post_client_message(
            stage_id,
            self.sender.server_id().to_string(),
            session.sid,
            account_id,
            forwarded_header,
            payload,
            reply_to,
        ) {
            warn!(error = %e, stage_id, "failed to forward user message to stage");
            if client_msg_seq != 0 {
                self.reply_error_to_client(session, &client_msg_id, client_msg_seq, e.to_error_code().code());
            }
            return;
        }

        if let Some((_, rx)) = registration {
            self.spawn_awaiter(session.clone(), client_msg_id, client_msg_seq, rx);
        }
    }

    async fn forward_join(
        &self,
        play: &Arc<PlayDispatcher>,
        session: &Arc<GatewaySession>,
        client_msg_id: String,
        client_msg_seq: u16,
        payload: Payload,
    ) {
        let registration = (client_msg_seq != 0).then(|| self.sender.request_cache().register(Some(self.config.request_timeout())));
        let forwarded_seq = registration.as_ref().map(|(seq, _)| *seq).unwrap_or(0);

        let envelope = CreateStageEnvelope {
            stage_type: self.config.default_stage_type.clone(),
            stage_key: None,
            join: Some(JoinEnvelope {
                account_id: None,
                session_nid: self.sender.server_id().to_string(),
                sid: session.sid,
                msg_id: client_msg_id.clone(),
                body: payload.to_bytes().to_vec(),
            }),
        };
        let body = match serde_json::to_vec(&envelope) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to encode join envelope");
                return;
            }
        };
        let header = Header::new(msgids::MSG_CREATE_JOIN_STAGE_REQ, forwarded_seq, 0, 0)
            .expect("reserved msgId is always valid")
            .with_base(true)
            .with_from(self.sender.server_id().to_string());
        let frame = InboundMeshFrame {
            from: self.sender.server_id().to_string(),
            to: self.sender.server_id().to_string(),
            header,
            payload: Payload::from_vec(body),
        };
        play.route(frame).await;

        if let Some((_, rx)) = registration {
            let session = session.clone();
            let compression_threshold = self.config.compression_threshold;
            let max_packet_bytes = self.config.max_packet_bytes;
            tokio::spawn(async move {
                let Ok(outcome) = rx.await else { return };
                match outcome {
                    RequestOutcome::Reply { header, payload } => {
                        let (error_code, body) = if header.is_success() {
                            match serde_json::from_slice::<JoinResultEnvelope>(payload.span()) {
                                Ok(result) => {
                                    session.bind(header.stage_id(), result.account_id);
                                    (0u16, result.body)
                                }
                                Err(e) => {
                                    warn!(error = %e, "malformed JoinResultEnvelope");
                                    (ErrorCode::SystemError.code(), Vec::new())
                                }
                            }
                        } else {
                            (header.error_code(), Vec::new())
                        };
                        reply_to_client(&session, &client_msg_id, client_msg_seq, error_code, &body, compression_threshold, max_packet_bytes);
                    }
                    RequestOutcome::Timeout => {
                        reply_to_client(&session, &client_msg_id, client_msg_seq, ErrorCode::RequestTimeout.code(), &[], compression_threshold, max_packet_bytes);
                    }
                    RequestOutcome::Disconnected => {}
                }
            });
        }
    }

    fn spawn_awaiter(&self, session: Arc<GatewaySession>, client_msg_id: String, client_msg_seq: u16, rx: tokio::sync::oneshot::Receiver<RequestOutcome>) {
        let compression_threshold = self.config.compression_threshold;
        let max_packet_bytes = self.config.max_packet_bytes;
        tokio::spawn(async move {
            let Ok(outcome) = rx.await else { return };
            match outcome {
                RequestOutcome::Reply { header, payload } => {
                    reply_to_client(&session, &client_msg_id, client_msg_seq, header.error_code(), payload.span(), compression_threshold, max_packet_bytes);
                }
                RequestOutcome::Timeout => {
                    reply_to_client(&session, &client_msg_id, client_msg_seq, ErrorCode::RequestTimeout.code(), &[], compression_threshold, max_packet_bytes);
                }
                RequestOutcome::Disconnected => {}
            }
        });
    }

    fn reply_error_to_client(&self, session: &Arc<GatewaySession>, msg_id: &str, msg_seq: u16, error_code: u16) {
        reply_to_client(session, msg_id, msg_seq, error_code, &[], self.config.compression_threshold, self.config.max_packet_bytes);
    }
}

/// Builds and pushes the client-facing reply frame, echoing the client's
/// own `msgId`/`msgSeq` regardless of whichever internal control msg-id
/// the dispatcher's reply actually carried (e.g. `JoinStageRes`).
fn reply_to_client(
    session: &Arc<GatewaySession>,
    msg_id: &str,
    msg_seq: u16,
    error_code: u16,
    body: &[u8],
    compression_threshold: usize,
    max_packet_bytes: usize,
) {
    let header = match Header::new(msg_id.to_string(), msg_seq, session.stage_id().unwrap_or(0), error_code) {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, "could not build client reply header");
            return;
        }
    };
    match encode_client_frame(&header, body, compression_threshold, max_packet_bytes) {
        Ok(frame) => session.push(frame.freeze()),
        Err(e) => warn!(error = %e, "failed to encode client reply frame"),
    }
}
