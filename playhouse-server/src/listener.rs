//! Accept loops for every configured transport (C3, §4.3). One TCP listener
//! always runs (`tcp_port`); TLS and the WebSocket upgrade route are both
//! optional, gated on `PlayHouseConfig.tls`/`PlayHouseConfig.websocket`.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use protocol::pool::BufferPool;
use tokio::net::TcpListener;
use tracing::{error, info};

use playhouse_core::PlayHouseConfig;

use crate::gateway::{GatewayContext, SessionRegistry};
use crate::{session, session_tls, session_ws};

/// Spawns the plain TCP accept loop. Runs until the listener itself fails
/// to bind; individual connection errors never bring the loop down.
pub async fn spawn_tcp(
    config: Arc<PlayHouseConfig>,
    registry: Arc<SessionRegistry>,
    context: GatewayContext,
    pool: BufferPool,
) -> Result<tokio::task::JoinHandle<()>, String> {
    let addr = format!("0.0.0.0:{}", config.tcp_port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| format!("failed to bind tcp {addr}: {e}"))?;
    info!(%addr, "tcp listener bound");

    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let registry = registry.clone();
                    let context = context.clone();
                    let pool = pool.clone();
                    tokio::spawn(async move {
                        session::handle_connection(stream, peer, registry, context, pool).await;
                    });
                }
                Err(e) => error!(error = %e, "tcp accept failed"),
            }
        }
    }))
}

/// Spawns the TLS accept loop, binding a second port distinct from the
/// plain TCP one (`tcp_port + 1`) so both transports can run side by side.
pub async fn spawn_tls(
    config: Arc<PlayHouseConfig>,
    registry: Arc<SessionRegistry>,
    context: GatewayContext,
    pool: BufferPool,
) -> Result<Option<tokio::task::JoinHandle<()>>, String> {
    let Some(tls_config) = config.tls.clone() else {
        return Ok(None);
    };
    let acceptor = session_tls::build_acceptor(&tls_config).await?;
    let addr = format!("0.0.0.0:{}", config.tcp_port + 1);
    let listener = TcpListener::bind(&addr).await.map_err(|e| format!("failed to bind tls {addr}: {e}"))?;
    info!(%addr, "tls listener bound");

    Ok(Some(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let acceptor = acceptor.clone();
                    let registry = registry.clone();
                    let context = context.clone();
                    let pool = pool.clone();
                    tokio::spawn(async move {
                        session_tls::handle_connection(acceptor, stream, peer, registry, context, pool).await;
                    });
                }
                Err(e) => error!(error = %e, "tls accept failed"),
            }
        }
    })))
}

#[derive(Clone)]
struct WsState {
    registry: Arc<SessionRegistry>,
    context: GatewayContext,
    pool: BufferPool,
}

/// Builds (but does not serve) the axum router for the WebSocket upgrade
/// route, if configured. `admin::router` is merged on top by the caller so
/// both share one HTTP listener.
pub fn ws_router(config: &PlayHouseConfig, registry: Arc<SessionRegistry>, context: GatewayContext, pool: BufferPool) -> Option<Router> {
    let ws_config = config.websocket.clone()?;
    let state = WsState { registry, context, pool };
    Some(Router::new().route(&ws_config.path, get(websocket_handler)).with_state(state))
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        session_ws::handle_connection(socket, state.registry, state.context, state.pool).await;
    })
}
