//! Minimal operator-facing status surface, generalizing the teacher's
//! `/reload`/`/enlist` pages to PlayHouse's own state: live stages (or
//! in-flight Api handlers) and known mesh peers.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;

use playhouse_core::server_info::ServerInfoCenter;
use playhouse_core::Sender;

use crate::gateway::{DispatchTarget, SessionRegistry};

#[derive(Clone)]
pub struct AdminState {
    pub sender: Arc<Sender>,
    pub directory: Arc<ServerInfoCenter>,
    pub target: Arc<DispatchTarget>,
    pub sessions: Arc<SessionRegistry>,
}

pub fn router(state: AdminState) -> Router {
    Router::new().route("/healthz", get(healthz)).route("/status", get(status)).with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<AdminState>) -> String {
    let peers = state.directory.all();
    let mut lines = vec![format!("server_id: {}", state.sender.server_id()), format!("sessions: {}", state.sessions.len())];

    match state.target.as_ref() {
        DispatchTarget::Play(play) => lines.push(format!("stages: {}", play.stage_count())),
        DispatchTarget::Api(api) => lines.push(format!("inflight: {}", api.inflight_count())),
    }

    lines.push(format!("request_cache in_flight: {}", state.sender.request_cache().in_flight_count()));
    lines.push(format!("peers: {}", peers.len()));
    for peer in peers {
        lines.push(format!(
            "  {:<20} {:<6} service={} weight={} state={:?}",
            peer.server_id,
            peer.bind_endpoint,
            peer.service_id,
            peer.weight,
            peer.state
        ));
    }
    lines.join("\n")
}
