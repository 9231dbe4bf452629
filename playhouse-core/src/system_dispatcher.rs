//! Control-plane message handling (C13, §4.13): heartbeats, pause/resume,
//! shutdown announcements, server-info queries, and peer discovery. These
//! arrive with `isSystem = true` and never carry a reply context worth
//! completing through C4 (the sender doesn't wait on them), so handlers
//! here are fire-and-forget. Anything beyond the built-ins goes through a
//! small registrable handler table, the same shape as C12's `ApiHandlerTable`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use protocol::msgids;
use protocol::payload::Payload;

use crate::config::{PlayHouseConfig, ServerRole as ConfigRole};
use crate::mesh::InboundMeshFrame;
use crate::sender::Sender;
use crate::server_info::{ServerInfo, ServerInfoCenter, ServerRole, ServerState};

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartBeatBody {
    pub server_id: String,
    pub bind_endpoint: String,
    pub role: WireRole,
    pub service_id: u16,
    pub weight: u32,
    pub state: WireServerState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerInfoBody {
    pub server_id: String,
    pub bind_endpoint: String,
    pub role: WireRole,
    pub service_id: u16,
    pub weight: u32,
    pub state: WireServerState,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum WireRole {
    Play,
    Api,
}

impl From<WireRole> for ServerRole {
    fn from(value: WireRole) -> Self {
        match value {
            WireRole::Play => ServerRole::Play,
            WireRole::Api => ServerRole::Api,
        }
    }
}

impl From<ConfigRole> for WireRole {
    fn from(value: ConfigRole) -> Self {
        match value {
            ConfigRole::Play => WireRole::Play,
            ConfigRole::Api => WireRole::Api,
        }
    }
}

/// Wire form of [`ServerState`] carried over a heartbeat or a server-info
/// reply, since `ServerState` itself has no `Serialize` impl to keep
/// C6 decoupled from the wire format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WireServerState {
    Running,
    Paused,
    Stopped,
}

impl From<WireServerState> for ServerState {
    fn from(value: WireServerState) -> Self {
        match value {
            WireServerState::Running => ServerState::Running,
            WireServerState::Paused => ServerState::Paused,
            WireServerState::Stopped => ServerState::Stopped,
        }
    }
}

/// Implemented by a server's role dispatcher (C10's `PlayDispatcher` or
/// C12's `ApiDispatcher`) so C13 can carry out a Pause/Resume system
/// message without depending on either directly (§4.14: "Pause: C10/C12
/// stop accepting new work but finish in-flight; Resume restores").
pub trait Pausable: Send + Sync {
    fn pause(&self);
    fn resume(&self);
    fn is_paused(&self) -> bool;
}

pub type SystemHandlerFn = Arc<dyn Fn(InboundMeshFrame, Arc<Sender>) + Send + Sync>;

#[derive(Default)]
pub struct SystemHandlerTable {
    handlers: HashMap<String, SystemHandlerFn>,
}

impl SystemHandlerTable {
    pub fn register(&mut self, msg_id: impl Into<String>, handler: SystemHandlerFn) {
        self.handlers.insert(msg_id.into(), handler);
    }
}

pub struct SystemDispatcher {
    sender: Arc<Sender>,
    directory: Arc<ServerInfoCenter>,
    config: Arc<PlayHouseConfig>,
    target: Arc<dyn Pausable>,
    handlers: HashMap<String, SystemHandlerFn>,
}

impl SystemDispatcher {
    pub fn new(sender: Arc<Sender>, directory: Arc<ServerInfoCenter>, config: Arc<PlayHouseConfig>, target: Arc<dyn Pausable>, table: SystemHandlerTable) -> Self {
        SystemDispatcher {
            sender,
            directory,
            config,
            target,
            handlers: table.handlers,
        }
    }

    /// Built by the heartbeat broadcaster (C14) to describe this server's
    /// current state to a peer, either as a heartbeat or a server-info reply.
    pub fn local_state(&self) -> WireServerState {
        if self.target.is_paused() {
            WireServerState::Paused
        } else {
            WireServerState::Running
        }
    }

    pub fn route(&self, frame: InboundMeshFrame) {
        match frame.header.msg_id() {
            msgids::MSG_HEART_BEAT => self.handle_heartbeat(frame),
            msgids::MSG_PAUSE => self.handle_pause(frame),
            msgids::MSG_RESUME => self.handle_resume(frame),
            msgids::MSG_SHUTDOWN => self.handle_shutdown(frame),
            msgids::MSG_SERVER_INFO_REQ => self.handle_server_info_req(frame),
            other => {
                if let Some(handler) = self.handlers.get(other).cloned() {
                    handler(frame, self.sender.clone());
                } else {
                    warn!(msg_id = other, "unrecognized system message");
                }
            }
        }
    }

    fn handle_heartbeat(&self, frame: InboundMeshFrame) {
        let body: HeartBeatBody = match serde_json::from_slice(frame.payload.span()) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "malformed heartbeat body");
                return;
            }
        };

        if self.directory.find_by_id(&body.server_id).is_some() {
            self.directory.touch_heartbeat(&body.server_id);
            if body.state == WireServerState::Paused || body.state == WireServerState::Stopped {
                self.directory.set_state(&body.server_id, body.state.into());
            }
        } else {
            self.directory.upsert(ServerInfo {
                server_id: body.server_id.clone(),
                bind_endpoint: body.bind_endpoint.clone(),
                role: body.role.into(),
                service_id: body.service_id,
                weight: body.weight,
                state: body.state.into(),
                last_heartbeat: std::time::Instant::now(),
            });
            self.sender.mesh().connect_peer(body.server_id.clone(), body.bind_endpoint.clone());
            debug!(server_id = body.server_id, "discovered new mesh peer via heartbeat");
        }
    }

    /// Stops C10/C12 from accepting new work; in-flight stages/handlers
    /// finish on their own.
    fn handle_pause(&self, frame: InboundMeshFrame) {
        self.target.pause();
        debug!(from = frame.from, "paused: no longer accepting new work");
    }

    fn handle_resume(&self, frame: InboundMeshFrame) {
        self.target.resume();
        debug!(from = frame.from, "resumed: accepting new work again");
    }

    /// A peer announcing it is going away. Marks it `Stopped` immediately
    /// rather than waiting for `sweep_dead_peers` to time it out.
    fn handle_shutdown(&self, frame: InboundMeshFrame) {
        self.directory.set_state(&frame.from, ServerState::Stopped);
        debug!(from = frame.from, "peer announced shutdown");
    }

    fn handle_server_info_req(&self, frame: InboundMeshFrame) {
        let body = ServerInfoBody {
            server_id: self.config.server_id.clone(),
            bind_endpoint: self.config.bind_endpoint.clone(),
            role: self.config.role.into(),
            service_id: self.config.service_id,
            weight: 1,
            state: self.local_state(),
        };
        let bytes = match serde_json::to_vec(&body) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to encode server info response");
                return;
            }
        };
        if let Err(e) = self.sender.send_to_system(&frame.from, msgids::MSG_SERVER_INFO_RES, Payload::from_vec(bytes)) {
            warn!(error = %e, peer = frame.from, "failed to reply to server info query");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::time::Duration;

    use protocol::header::Header;
    use protocol::payload::Payload;

    use crate::config::{GameLoopConfig, PoolConfig};
    use crate::mesh::MeshSocket;
    use crate::request_cache::RequestCache;

    #[derive(Default)]
    struct TestTarget {
        paused: AtomicBool,
    }

    impl Pausable for TestTarget {
        fn pause(&self) {
            self.paused.store(true, AtomicOrdering::Relaxed);
        }
        fn resume(&self) {
            self.paused.store(false, AtomicOrdering::Relaxed);
        }
        fn is_paused(&self) -> bool {
            self.paused.load(AtomicOrdering::Relaxed)
        }
    }

    fn test_config(server_id: &str) -> Arc<PlayHouseConfig> {
        Arc::new(PlayHouseConfig {
            server_id: server_id.to_string(),
            role: ConfigRole::Play,
            service_id: 1,
            tcp_port: 9000,
            bind_endpoint: format!("tcp://127.0.0.1:0/{server_id}"),
            peer_endpoints: Vec::new(),
            request_timeout_ms: 5_000,
            authenticate_message_id: "Auth".to_string(),
            default_stage_type: "default".to_string(),
            pool: PoolConfig::default(),
            game_loop: GameLoopConfig::new(50, 250),
            compression_threshold: 1024,
            max_packet_bytes: 1 << 20,
            max_msg_id_len: 128,
            heartbeat_interval_ms: 5_000,
            discovery_refresh_ms: 10_000,
            tls: None,
            websocket: None,
        })
    }

    fn test_dispatcher(port: u16) -> (SystemDispatcher, Arc<ServerInfoCenter>, Arc<TestTarget>) {
        let mesh = MeshSocket::bind(format!("node-{port}"), &format!("tcp://127.0.0.1:{port}")).unwrap();
        let directory = Arc::new(ServerInfoCenter::new(3));
        let cache = Arc::new(RequestCache::new(Duration::from_secs(5)));
        let sender = Arc::new(Sender::new(format!("node-{port}"), mesh, directory.clone(), cache));
        let target = Arc::new(TestTarget::default());
        let dispatcher = SystemDispatcher::new(sender, directory.clone(), test_config(&format!("node-{port}")), target.clone(), SystemHandlerTable::default());
        (dispatcher, directory, target)
    }

    fn heartbeat_frame(from: &str, state: WireServerState) -> InboundMeshFrame {
        let body = HeartBeatBody {
            server_id: from.to_string(),
            bind_endpoint: format!("tcp://127.0.0.1:{from}"),
            role: WireRole::Api,
            service_id: 7,
            weight: 1,
            state,
        };
        let header = Header::new(msgids::MSG_HEART_BEAT, 0, 0, 0).unwrap().with_system(true);
        InboundMeshFrame {
            from: from.to_string(),
            to: "self".to_string(),
            header,
            payload: Payload::from_vec(serde_json::to_vec(&body).unwrap()),
        }
    }

    #[test]
    fn heartbeat_from_unknown_peer_registers_it() {
        let (dispatcher, directory, _target) = test_dispatcher(28931);
        dispatcher.route(heartbeat_frame("peer-1", WireServerState::Running));
        assert!(directory.find_by_id("peer-1").is_some());
    }

    #[test]
    fn pause_message_stops_target_then_resume_restores_it() {
        let (dispatcher, _directory, target) = test_dispatcher(28933);
        let header = Header::new(msgids::MSG_PAUSE, 0, 0, 0).unwrap().with_system(true);
        dispatcher.route(InboundMeshFrame {
            from: "admin".to_string(),
            to: "self".to_string(),
            header,
            payload: Payload::empty(),
        });
        assert!(target.is_paused());

        let header = Header::new(msgids::MSG_RESUME, 0, 0, 0).unwrap().with_system(true);
        dispatcher.route(InboundMeshFrame {
            from: "admin".to_string(),
            to: "self".to_string(),
            header,
            payload: Payload::empty(),
        });
        assert!(!target.is_paused());
    }

    #[test]
    fn shutdown_message_marks_peer_stopped() {
        let (dispatcher, directory, _target) = test_dispatcher(28935);
        dispatcher.route(heartbeat_frame("peer-2", WireServerState::Running));
        let header = Header::new(msgids::MSG_SHUTDOWN, 0, 0, 0).unwrap().with_system(true);
        dispatcher.route(InboundMeshFrame {
            from: "peer-2".to_string(),
            to: "self".to_string(),
            header,
            payload: Payload::empty(),
        });
        assert_eq!(directory.find_by_id("peer-2").unwrap().state, ServerState::Stopped);
    }
}
