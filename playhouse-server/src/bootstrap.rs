//! Server lifecycle (C14, §4.14): boot order, the top-level inbound mesh
//! routing loop, and the periodic heartbeat/maintenance background tasks.
//!
//! Boot order: warm the buffer pool, bind the mesh socket (including the
//! loopback self-connect every in-process gateway request/reply
//! correlation relies on), build the dispatcher for this server's role,
//! start the client-facing listeners, then hand control to the inbound
//! routing loop until the mesh channel closes.
//!
//! `peer_endpoints` entries use the convention `server_id@bind_endpoint` so
//! this side can address a heartbeat to a peer it has never heard from yet
//! (ZMQ ROUTER addressing needs the peer's own declared identity, not just
//! its endpoint).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use playhouse_core::config::ServerRole as ConfigRole;
use playhouse_core::play_dispatcher::StageTypeDef;
use playhouse_core::server_info::ServerInfoCenter;
use playhouse_core::system_dispatcher::{HeartBeatBody, Pausable, WireServerState};
use playhouse_core::{ApiDispatcher, ApiHandlerTable, InboundMeshFrame, MeshSocket, PlayDispatcher, PlayHouseConfig, RequestCache, Sender, SystemDispatcher, SystemHandlerTable};
use protocol::msgids;
use protocol::payload::Payload;
use protocol::pool::BufferPool;

use crate::admin::{self, AdminState};
use crate::gateway::{DispatchTarget, GatewayContext, SessionRegistry};
use crate::listener;

/// How many consecutive missed heartbeat intervals before a peer is
/// dropped from the directory (§4.6).
const MISSED_HEARTBEAT_LIMIT: u32 = 3;

/// Brings up every component and runs until the inbound mesh channel
/// closes (normally only on process shutdown). `stage_types` is only
/// consulted for a `Play`-role server; `api_handlers` only for `Api`.
pub async fn run(config: PlayHouseConfig, stage_types: Vec<StageTypeDef>, api_handlers: ApiHandlerTable) -> Result<(), String> {
    let config = Arc::new(config);

    let pool = BufferPool::new(config.pool.clone().into_buffer_pool_config());

    let mesh = MeshSocket::bind(config.server_id.clone(), &config.bind_endpoint).map_err(|e| e.to_string())?;
    mesh.connect_peer(config.server_id.clone(), config.bind_endpoint.clone());

    let bootstrap_peers = parse_bootstrap_peers(&config.peer_endpoints);
    for (peer_id, endpoint) in &bootstrap_peers {
        mesh.connect_peer(peer_id.clone(), endpoint.clone());
    }

    let directory = Arc::new(ServerInfoCenter::new(MISSED_HEARTBEAT_LIMIT));
    let request_cache = Arc::new(RequestCache::new(config.request_timeout()));
    let sender = Arc::new(Sender::new(config.server_id.clone(), mesh.clone(), directory.clone(), request_cache.clone()));

    let target = Arc::new(match config.role {
        ConfigRole::Play => DispatchTarget::Play(PlayDispatcher::new(sender.clone(), stage_types)),
        ConfigRole::Api => DispatchTarget::Api(Arc::new(ApiDispatcher::new(sender.clone(), api_handlers))),
    });
    let pausable: Arc<dyn Pausable> = target.clone();
    let system_dispatcher = Arc::new(SystemDispatcher::new(sender.clone(), directory.clone(), config.clone(), pausable, SystemHandlerTable::default()));

    let session_registry = SessionRegistry::new();
    let context = GatewayContext { config: config.clone(), sender: sender.clone(), target: target.clone() };

    let tcp_handle = listener::spawn_tcp(config.clone(), session_registry.clone(), context.clone(), pool.clone()).await?;
    let tls_handle = listener::spawn_tls(config.clone(), session_registry.clone(), context.clone(), pool.clone()).await?;

    let mut http_router = admin::router(AdminState {
        sender: sender.clone(),
        directory: directory.clone(),
        target: target.clone(),
        sessions: session_registry.clone(),
    });
    if let Some(ws_router) = listener::ws_router(&config, session_registry.clone(), context.clone(), pool.clone()) {
        http_router = http_router.merge(ws_router);
    }
    let http_addr = format!("0.0.0.0:{}", config.tcp_port + 2);
    let http_listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .map_err(|e| format!("failed to bind http {http_addr}: {e}"))?;
    info!(addr = %http_addr, "admin/ws http listener bound");
    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, http_router).await {
            warn!(error = %e, "http server exited");
        }
    });

    spawn_heartbeat_broadcaster(config.clone(), sender.clone(), directory.clone(), target.clone(), bootstrap_peers);
    spawn_maintenance(config.clone(), request_cache.clone(), directory.clone(), pool.clone());

    let inbound = mesh.take_inbound().expect("inbound receiver taken exactly once during bootstrap");
    run_inbound_loop(inbound, sender, system_dispatcher, target, session_registry, config).await;

    tcp_handle.abort();
    if let Some(handle) = tls_handle {
        handle.abort();
    }
    http_handle.abort();
    mesh.shutdown();
    Ok(())
}

fn parse_bootstrap_peers(entries: &[String]) -> Vec<(String, String)> {
    entries
        .iter()
        .filter_map(|entry| match entry.split_once('@') {
            Some((id, endpoint)) => Some((id.to_string(), endpoint.to_string())),
            None => {
                warn!(entry, "ignoring peerEndpoint not in `server_id@endpoint` form");
                None
            }
        })
        .collect()
}

/// Periodically announces this server to every peer already known in the
/// directory plus the statically configured bootstrap set, and lets
/// `ServerInfoCenter::sweep_dead_peers` drop anyone who stops answering.
/// Carries this server's own pause state so a paused peer is visible to
/// the rest of the mesh instead of just going quiet.
fn spawn_heartbeat_broadcaster(
    config: Arc<PlayHouseConfig>,
    sender: Arc<Sender>,
    directory: Arc<ServerInfoCenter>,
    target: Arc<DispatchTarget>,
    bootstrap_peers: Vec<(String, String)>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.heartbeat_interval());
        loop {
            interval.tick().await;
            let state = if target.is_paused() { WireServerState::Paused } else { WireServerState::Running };
            let body = HeartBeatBody {
                server_id: config.server_id.clone(),
                bind_endpoint: config.bind_endpoint.clone(),
                role: config.role.into(),
                service_id: config.service_id,
                weight: 1,
                state,
            };
            let payload = match serde_json::to_vec(&body) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "failed to encode heartbeat body");
                    continue;
                }
            };

            let mut targets: Vec<String> = directory.all().into_iter().map(|peer| peer.server_id).collect();
            for (peer_id, _) in &bootstrap_peers {
                if !targets.contains(peer_id) {
                    targets.push(peer_id.clone());
                }
            }

            for peer_id in targets {
                if let Err(e) = sender.send_to_system(&peer_id, msgids::MSG_HEART_BEAT, Payload::from_vec(payload.clone())) {
                    warn!(error = %e, peer_id, "failed to send heartbeat");
                }
            }

            directory.sweep_dead_peers(config.heartbeat_interval());
        }
    });
}

/// Periodic housekeeping unrelated to any single inbound frame: sweeping
/// timed-out request-cache entries and trimming the buffer pool's idle
/// buckets back toward their warm-up counts.
fn spawn_maintenance(config: Arc<PlayHouseConfig>, request_cache: Arc<RequestCache>, directory: Arc<ServerInfoCenter>, pool: BufferPool) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            request_cache.sweep();
            directory.sweep_dead_peers(config.heartbeat_interval());
            pool.trim_idle();
        }
    });
}

/// Implements the inbound routing priority from §4.10/§4.13: a reply
/// always completes the request cache first, system traffic goes to the
/// control-plane dispatcher, a client push bypasses both user-facing
/// dispatchers entirely, and everything else is this server's own role
/// (Play or Api). `PlayDispatcher::route` is awaited inline rather than
/// spawned so that two messages for the same stage enqueue in the order
/// they arrived on the wire.
async fn run_inbound_loop(
    mut inbound: UnboundedReceiver<InboundMeshFrame>,
    sender: Arc<Sender>,
    system_dispatcher: Arc<SystemDispatcher>,
    target: Arc<DispatchTarget>,
    session_registry: Arc<SessionRegistry>,
    config: Arc<PlayHouseConfig>,
) {
    info!("inbound mesh routing loop started");
    while let Some(frame) = inbound.recv().await {
        if frame.header.is_reply() {
            sender.request_cache().try_complete(frame.header, frame.payload);
            continue;
        }
        if frame.header.is_system() {
            system_dispatcher.route(frame);
            continue;
        }
        if frame.header.is_base() && frame.header.msg_id() == msgids::MSG_SEND_TO_CLIENT {
            session_registry.deliver_push(frame.payload.span(), config.compression_threshold, config.max_packet_bytes);
            continue;
        }
        match target.as_ref() {
            DispatchTarget::Play(play) => play.route(frame).await,
            DispatchTarget::Api(api) => api.route(frame),
        }
    }
    info!("inbound mesh routing loop stopped, mesh channel closed");
}
