use std::sync::Arc;

use async_trait::async_trait;
use playhouse_core::actor::{Actor, ActorBehavior};
use playhouse_core::config::{PlayHouseConfig, ServerRole};
use playhouse_core::play_dispatcher::stage_type;
use playhouse_core::stage::{StageHandlers, StageSender};
use playhouse_core::{ApiHandlerTable, StageTypeDef};
use protocol::packet::ClientPacket;
use protocol::payload::Payload;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Demo actor used by the bundled "echo" stage type: authentication just
/// accepts whatever payload the client sent as its account id.
struct EchoBehavior;

#[async_trait]
impl ActorBehavior for EchoBehavior {
    async fn on_create(&mut self, _actor: &mut Actor) {}

    async fn on_authenticate(&mut self, actor: &mut Actor, packet: &ClientPacket) -> (bool, Payload) {
        actor.account_id = String::from_utf8_lossy(packet.payload.span()).into_owned();
        (true, Payload::empty())
    }

    async fn on_post_authenticate(&mut self, _actor: &mut Actor) {}

    async fn on_destroy(&mut self, _actor: &mut Actor) {}

    async fn on_connection_changed(&mut self, _actor: &mut Actor, _connected: bool) {}
}

/// Bundled stage type that echoes any `Echo` message straight back to its
/// sender. Registered so a fresh checkout has something to connect to; a
/// real deployment registers its own stage types here instead.
fn demo_stage_types(config: &PlayHouseConfig) -> Vec<StageTypeDef> {
    let mut handlers = StageHandlers::default();
    handlers.user.insert(
        "Echo".to_string(),
        Arc::new(|_actor: &mut Actor, packet: ClientPacket, _stage: StageSender| {
            Box::pin(async move { (0u16, packet.payload) })
        }),
    );
    vec![stage_type(config.default_stage_type.clone(), config.authenticate_message_id.clone(), || Box::new(EchoBehavior), handlers)]
}

/// Bundled Api handler that echoes its payload back, mirroring the Play
/// role's "Echo" stage handler for Api-role deployments.
fn demo_api_handlers() -> ApiHandlerTable {
    let mut table = ApiHandlerTable::default();
    table.register("Echo", Arc::new(|packet: ClientPacket, _sender| Box::pin(async move { (0u16, packet.payload) })));
    table
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| format!("{}=trace", env!("CARGO_CRATE_NAME")).into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let config = match PlayHouseConfig::load(&config_path).await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, config_path, "failed to load config");
            std::process::exit(1);
        }
    };

    let stage_types = if config.role == ServerRole::Play { demo_stage_types(&config) } else { Vec::new() };
    let api_handlers = if config.role == ServerRole::Api { demo_api_handlers() } else { ApiHandlerTable::default() };

    if let Err(e) = playhouse_server::bootstrap::run(config, stage_types, api_handlers).await {
        tracing::error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}
