//! Sender facade (C7, §4.7): the uniform send/request API built over C4
//! (request cache) and C5 (mesh socket). `Stage`/`Actor` wrap this with
//! their own extra operations (timers, game loop, client push).

use std::sync::Arc;
use std::time::Duration;

use protocol::header::Header;
use protocol::payload::Payload;

use crate::error::CoreError;
use crate::mesh::MeshSocket;
use crate::request_cache::{RequestCache, RequestOutcome};
use crate::server_info::ServerInfoCenter;

/// Policy for picking a destination when addressing a service rather than
/// a specific server-id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePolicy {
    RoundRobin,
    AccountAffinity,
}

/// The context a reply is sent in: which peer and msg-seq to echo back to.
#[derive(Debug, Clone)]
pub struct ReplyContext {
    pub to: String,
    pub msg_seq: u16,
    pub stage_id: i64,
}

pub struct Sender {
    server_id: String,
    mesh: Arc<MeshSocket>,
    directory: Arc<ServerInfoCenter>,
    request_cache: Arc<RequestCache>,
}

impl Sender {
    pub fn new(
        server_id: impl Into<String>,
        mesh: Arc<MeshSocket>,
        directory: Arc<ServerInfoCenter>,
        request_cache: Arc<RequestCache>,
    ) -> Self {
        Sender {
            server_id: server_id.into(),
            mesh,
            directory,
            request_cache,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    fn one_way_header(&self, msg_id: &str, stage_id: i64, error_code: u16) -> Result<Header, CoreError> {
        Ok(Header::new(msg_id.to_string(), 0, stage_id, error_code)?.with_from(self.server_id.clone()))
    }

    /// Echoes a reply into the scope that produced `ctx`, so the original
    /// requester's C4 entry is completed on the peer side.
    pub fn reply(&self, ctx: &ReplyContext, msg_id: &str, error_code: u16, payload: Payload) -> Result<(), CoreError> {
        let header = Header::new(msg_id.to_string(), ctx.msg_seq, ctx.stage_id, error_code)?
            .with_from(self.server_id.clone())
            .with_reply(true);
        self.mesh.send(ctx.to.clone(), header, payload.to_bytes().to_vec())
    }

    pub fn send_to_api(&self, server_id: &str, msg_id: &str, payload: Payload) -> Result<(), CoreError> {
        let header = self.one_way_header(msg_id, 0, 0)?;
        self.mesh.send(server_id.to_string(), header, payload.to_bytes().to_vec())
    }

    pub fn send_to_stage(&self, server_id: &str, stage_id: i64, msg_id: &str, payload: Payload) -> Result<(), CoreError> {
        let header = self.one_way_header(msg_id, stage_id, 0)?;
        self.mesh.send(server_id.to_string(), header, payload.to_bytes().to_vec())
    }

    pub fn send_to_system(&self, server_id: &str, msg_id: &str, payload: Payload) -> Result<(), CoreError> {
        let header = self.one_way_header(msg_id, 0, 0)?.with_system(true);
        self.mesh.send(server_id.to_string(), header, payload.to_bytes().to_vec())
    }

    pub fn send_to_api_service(&self, service_id: u16, policy: ServicePolicy, account_id: Option<&str>, msg_id: &str, payload: Payload) -> Result<(), CoreError> {
        let target = match policy {
            ServicePolicy::RoundRobin => self.directory.find_round_robin(service_id),
            ServicePolicy::AccountAffinity => {
                let account_id = account_id.ok_or_else(|| CoreError::System("account affinity requires an accountId".into()))?;
                self.directory.find_by_account_id(service_id, account_id)
            }
        };
        let target = target.ok_or_else(|| CoreError::System(format!("no live server for service {service_id}")))?;
        self.send_to_api(&target.server_id, msg_id, payload)
    }

    /// Allocates a `msgSeq`, registers it in C4, sends the request, and
    /// resolves once a reply, timeout, or disconnect completes it.
    pub async fn request_to(
        &self,
        server_id: &str,
        stage_id: i64,
        msg_id: &str,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> Result<(Header, Payload), CoreError> {
        let (seq, rx) = self.request_cache.register(timeout);
        let header = Header::new(msg_id.to_string(), seq, stage_id, 0)?.with_from(self.server_id.clone());
        if let Err(e) = self.mesh.send(server_id.to_string(), header, payload.to_bytes().to_vec()) {
            self.request_cache.fail(seq, RequestOutcome::Disconnected);
            return Err(e);
        }
        match rx.await {
            Ok(outcome) => outcome.into_result().map_err(|e| match e {
                CoreError::RequestTimeout(_) => CoreError::RequestTimeout(seq),
                other => other,
            }),
            Err(_) => Err(CoreError::Disconnected),
        }
    }

    pub fn request_cache(&self) -> &Arc<RequestCache> {
        &self.request_cache
    }

    pub fn directory(&self) -> &Arc<ServerInfoCenter> {
        &self.directory
    }

    pub fn mesh(&self) -> &Arc<MeshSocket> {
        &self.mesh
    }
}

/// What [`RequestOutcome`] becomes once the caller inspects it directly
/// (used by handlers that want to branch on timeout vs disconnect rather
/// than a uniform error).
pub fn classify_outcome(outcome: RequestOutcome) -> Result<(Header, Payload), CoreError> {
    outcome.into_result()
}
