//! Reserved, control-plane msg-ids and framework error codes.
//!
//! These are the vocabulary every server in the mesh agrees on without
//! negotiation. User handlers never register these msg-ids themselves;
//! the dispatchers (`playhouse-core`) intercept them before user code runs.

/// Maximum length in bytes of a `msgId` string (§3, §4.2).
pub const MAX_MSG_ID_LEN: usize = 128;

/// Maximum total frame length on the client wire (§4.2).
pub const MAX_PACKET_BYTES: usize = 10 * 1024 * 1024;

/// Default compression threshold in bytes (§4.2, §6).
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Default request timeout in milliseconds (§6).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

// -- Control-plane msg-ids (`isBase = true`) -- see spec §6.

pub const MSG_CREATE_STAGE_REQ: &str = "CreateStageReq";
pub const MSG_CREATE_STAGE_RES: &str = "CreateStageRes";
pub const MSG_CREATE_JOIN_STAGE_REQ: &str = "CreateJoinStageReq";
pub const MSG_CREATE_JOIN_STAGE_RES: &str = "CreateJoinStageRes";
pub const MSG_JOIN_STAGE_REQ: &str = "JoinStageReq";
pub const MSG_JOIN_STAGE_RES: &str = "JoinStageRes";
pub const MSG_GET_OR_CREATE_STAGE_REQ: &str = "GetOrCreateStageReq";
pub const MSG_GET_OR_CREATE_STAGE_RES: &str = "GetOrCreateStageRes";
pub const MSG_DESTROY_STAGE: &str = "DestroyStage";
pub const MSG_RECONNECT: &str = "ReconnectMsg";
pub const MSG_DISCONNECT_NOTICE: &str = "DisconnectNoticeMsg";
pub const MSG_TIMER: &str = "TimerMsg";
pub const MSG_STAGE_TIMER: &str = "StageTimer";
pub const MSG_ASYNC_BLOCK: &str = "AsyncBlock";
pub const MSG_HEART_BEAT: &str = "HeartBeat";
/// Gateway-level push: delivers a `ClientPushEnvelope` body to a live
/// client session identified by `sid`, intercepted by the transport layer
/// before reaching `PlayDispatcher`.
pub const MSG_SEND_TO_CLIENT: &str = "SendToClient";

// -- Control-plane msg-ids (`isSystem = true`) -- C13's handler table, §4.13.

pub const MSG_PAUSE: &str = "Pause";
pub const MSG_RESUME: &str = "Resume";
pub const MSG_SHUTDOWN: &str = "Shutdown";
pub const MSG_SERVER_INFO_REQ: &str = "ServerInfoReq";
pub const MSG_SERVER_INFO_RES: &str = "ServerInfoRes";

/// All of the reserved base msg-ids, for membership checks.
pub const BASE_MSG_IDS: &[&str] = &[
    MSG_CREATE_STAGE_REQ,
    MSG_CREATE_STAGE_RES,
    MSG_CREATE_JOIN_STAGE_REQ,
    MSG_CREATE_JOIN_STAGE_RES,
    MSG_JOIN_STAGE_REQ,
    MSG_JOIN_STAGE_RES,
    MSG_GET_OR_CREATE_STAGE_REQ,
    MSG_GET_OR_CREATE_STAGE_RES,
    MSG_DESTROY_STAGE,
    MSG_RECONNECT,
    MSG_DISCONNECT_NOTICE,
    MSG_TIMER,
    MSG_STAGE_TIMER,
    MSG_ASYNC_BLOCK,
    MSG_HEART_BEAT,
    MSG_SEND_TO_CLIENT,
];

/// All of the reserved system msg-ids, for membership checks.
pub const SYSTEM_MSG_IDS: &[&str] = &[MSG_HEART_BEAT, MSG_PAUSE, MSG_RESUME, MSG_SHUTDOWN, MSG_SERVER_INFO_REQ, MSG_SERVER_INFO_RES];

/// Framework-reserved error codes, `1..1000` (§6). `0` is success and
/// `1000+` is reserved for user error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Success = 0,
    NotRegisteredMessage = 1,
    HandlerNotFound = 2,
    StageIsNotExist = 3,
    AlreadyExistStage = 4,
    RequestTimeout = 5,
    Unauthenticated = 6,
    SystemError = 7,
    UncheckedContentsError = 8,
    Disconnected = 9,
}

impl ErrorCode {
    pub const fn code(self) -> u16 {
        self as u16
    }

    pub fn is_success(code: u16) -> bool {
        code == Self::Success.code()
    }
}

impl From<ErrorCode> for u16 {
    fn from(value: ErrorCode) -> Self {
        value.code()
    }
}
