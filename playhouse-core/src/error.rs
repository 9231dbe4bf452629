//! Errors raised by the runtime core, layered on top of the wire-level
//! errors from `protocol`.

use thiserror::Error;

use protocol::msgids::ErrorCode;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("stage {0} does not exist")]
    StageNotExist(i64),

    #[error("stage {0} already exists")]
    StageAlreadyExists(i64),

    #[error("no handler registered for msgId {0:?}")]
    HandlerNotFound(String),

    #[error("msgId {0:?} is not registered")]
    NotRegisteredMessage(String),

    #[error("request timed out waiting for msgSeq {0}")]
    RequestTimeout(u16),

    #[error("session is not authenticated")]
    Unauthenticated,

    #[error("session disconnected before a reply arrived")]
    Disconnected,

    #[error("duplicate timer id {0} in stage {1}")]
    DuplicateTimerId(u64, i64),

    #[error("codec error: {0}")]
    Codec(#[from] protocol::CodecError),

    #[error("model error: {0}")]
    Model(#[from] protocol::ModelError),

    #[error("mesh transport error: {0}")]
    Mesh(String),

    #[error("{0}")]
    System(String),
}

impl CoreError {
    /// Maps a core error onto the framework error-code vocabulary carried
    /// back to the client in a reply header.
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            CoreError::StageNotExist(_) => ErrorCode::StageIsNotExist,
            CoreError::StageAlreadyExists(_) => ErrorCode::AlreadyExistStage,
            CoreError::HandlerNotFound(_) => ErrorCode::HandlerNotFound,
            CoreError::NotRegisteredMessage(_) => ErrorCode::NotRegisteredMessage,
            CoreError::RequestTimeout(_) => ErrorCode::RequestTimeout,
            CoreError::Unauthenticated => ErrorCode::Unauthenticated,
            CoreError::Disconnected => ErrorCode::Disconnected,
            CoreError::Codec(_) | CoreError::Model(_) => ErrorCode::UncheckedContentsError,
            CoreError::DuplicateTimerId(_, _) | CoreError::Mesh(_) | CoreError::System(_) => {
                ErrorCode::SystemError
            }
        }
    }
}
