//! Runtime core for PlayHouse: the server-side pieces every Play or Api
//! process needs regardless of which transport its clients connect over —
//! the mesh socket, request/reply correlation, the peer directory, the
//! sender facade, actors and stages, and the three message dispatchers.

pub mod actor;
pub mod api_dispatcher;
pub mod config;
pub mod error;
pub mod mesh;
pub mod play_dispatcher;
pub mod request_cache;
pub mod sender;
pub mod server_info;
pub mod stage;
pub mod system_dispatcher;

pub use actor::{Actor, ActorBehavior, ActorSender, ActorState};
pub use api_dispatcher::{ApiDispatcher, ApiHandlerFn, ApiHandlerTable};
pub use config::PlayHouseConfig;
pub use error::CoreError;
pub use mesh::{InboundMeshFrame, MeshSocket};
pub use play_dispatcher::{stage_type, PlayDispatcher, StageTypeDef};
pub use request_cache::{RequestCache, RequestOutcome};
pub use sender::{ReplyContext, Sender, ServicePolicy};
pub use server_info::{ServerInfo, ServerInfoCenter, ServerRole, ServerState};
pub use stage::{BaseStage, MailboxMessage, StageHandle, StageHandlers, StageSender};
pub use system_dispatcher::{Pausable, SystemDispatcher, SystemHandlerFn, SystemHandlerTable};
