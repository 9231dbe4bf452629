//! Stateless-server message routing (C12, §4.12). Unlike a stage, an Api
//! handler has no serialized mailbox: every inbound message gets its own
//! task so handlers run fully concurrently, and a failing handler can
//! never wedge another request behind it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use protocol::msgids::ErrorCode;
use protocol::packet::ClientPacket;
use protocol::payload::Payload;

use crate::mesh::InboundMeshFrame;
use crate::sender::{ReplyContext, Sender};
use crate::system_dispatcher::Pausable;

pub type ApiHandlerFuture = Pin<Box<dyn Future<Output = (u16, Payload)> + Send>>;
pub type ApiHandlerFn = Arc<dyn Fn(ClientPacket, Arc<Sender>) -> ApiHandlerFuture + Send + Sync>;

#[derive(Default)]
pub struct ApiHandlerTable {
    handlers: HashMap<String, ApiHandlerFn>,
}

impl ApiHandlerTable {
    pub fn register(&mut self, msg_id: impl Into<String>, handler: ApiHandlerFn) {
        self.handlers.insert(msg_id.into(), handler);
    }
}

pub struct ApiDispatcher {
    sender: Arc<Sender>,
    handlers: HashMap<String, ApiHandlerFn>,
    draining: Arc<AtomicBool>,
    paused: AtomicBool,
    inflight: Arc<AtomicU64>,
}

impl ApiDispatcher {
    pub fn new(sender: Arc<Sender>, table: ApiHandlerTable) -> Self {
        ApiDispatcher {
            sender,
            handlers: table.handlers,
            draining: Arc::new(AtomicBool::new(false)),
            paused: AtomicBool::new(false),
            inflight: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn inflight_count(&self) -> u64 {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Dispatches one inbound message onto its own task. Returns
    /// immediately; the handler's reply (if any) is sent once it finishes.
    pub fn route(&self, frame: InboundMeshFrame) {
        let msg_id = frame.header.msg_id().to_string();
        let msg_seq = frame.header.msg_seq();
        let stage_id = frame.header.stage_id();
        let from = frame.from.clone();

        if self.draining.load(Ordering::Relaxed) || self.paused.load(Ordering::Relaxed) {
            warn!(msg_id, "rejected inbound message, dispatcher is draining or paused");
            if msg_seq != 0 {
                let _ = self.sender.reply(
                    &ReplyContext { to: from, msg_seq, stage_id },
                    &msg_id,
                    ErrorCode::SystemError.code(),
                    Payload::empty(),
                );
            }
            return;
        }

        let Some(handler) = self.handlers.get(&msg_id).cloned() else {
            warn!(msg_id, "no Api handler registered");
            if msg_seq != 0 {
                let _ = self.sender.reply(
                    &ReplyContext { to: from, msg_seq, stage_id },
                    &msg_id,
                    ErrorCode::HandlerNotFound.code(),
                    Payload::empty(),
                );
            }
            return;
        };

        let sender = self.sender.clone();
        let inflight = self.inflight.clone();
        inflight.fetch_add(1, Ordering::Relaxed);

        let packet = ClientPacket::new(frame.header, frame.payload);
        tokio::spawn(async move {
            let outcome = tokio::spawn(handler(packet, sender.clone())).await;
            inflight.fetch_sub(1, Ordering::Relaxed);

            let (error_code, reply_payload) = match outcome {
                Ok(result) => result,
                Err(join_error) => {
                    error!(msg_id, error = %join_error, "Api handler panicked");
                    (ErrorCode::SystemError.code(), Payload::empty())
                }
            };
            if msg_seq != 0 {
                let _ = sender.reply(&ReplyContext { to: from, msg_seq, stage_id }, &msg_id, error_code, reply_payload);
            }
        });
    }

    /// Stops accepting new messages and waits (bounded by `timeout`) for
    /// in-flight handlers to finish, used during C14 shutdown.
    pub async fn drain(&self, timeout: Duration) {
        self.draining.store(true, Ordering::Relaxed);
        let deadline = tokio::time::Instant::now() + timeout;
        while self.inflight_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if self.inflight_count() > 0 {
            warn!(remaining = self.inflight_count(), "drain timed out with handlers still in flight");
        }
    }
}

impl Pausable for ApiDispatcher {
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

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::header::Header;

    use crate::mesh::MeshSocket;
    use crate::request_cache::RequestCache;
    use crate::server_info::ServerInfoCenter;

    fn test_sender(port: u16) -> Arc<Sender> {
        let mesh = MeshSocket::bind(format!("node-{port}"), &format!("tcp://127.0.0.1:{port}")).unwrap();
        let directory = Arc::new(ServerInfoCenter::new(3));
        let cache = Arc::new(RequestCache::new(Duration::from_secs(5)));
        Arc::new(Sender::new(format!("node-{port}"), mesh, directory, cache))
    }

    #[tokio::test]
    async fn unregistered_handler_replies_handler_not_found() {
        let sender = test_sender(28921);
        let node_b = MeshSocket::bind("node-b-28921", "tcp://127.0.0.1:28922").unwrap();
        sender.mesh().connect_peer("node-b-28921", "tcp://127.0.0.1:28922");
        tokio::time::sleep(Duration::from_millis(150)).await;

        let dispatcher = ApiDispatcher::new(sender, ApiHandlerTable::default());
        let header = Header::new("Unknown", 1, 0, 0).unwrap().with_from("node-b-28921");
        let frame = InboundMeshFrame {
            from: "node-b-28921".to_string(),
            to: "node-a".to_string(),
            header,
            payload: Payload::empty(),
        };
        dispatcher.route(frame);

        let mut inbound = node_b.take_inbound().unwrap();
        let received = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(received.header.error_code(), ErrorCode::HandlerNotFound.code());
    }
}
