//! Control-plane command classification (§4.9 "Commands"). Kept as a
//! tagged enum plus a lookup from msg-id rather than ad-hoc string
//! branching scattered through the dispatcher, so the full set of
//! recognized control messages is auditable in one place (§9 "Dynamic
//! dispatch across commands").

use protocol::msgids;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageCommandKind {
    CreateStage,
    JoinStage,
    CreateJoinStage,
    GetOrCreateStage,
    DestroyStage,
    Reconnect,
    DisconnectNotice,
}

impl StageCommandKind {
    pub fn from_msg_id(msg_id: &str) -> Option<Self> {
        match msg_id {
            id if id == msgids::MSG_CREATE_STAGE_REQ => Some(Self::CreateStage),
            id if id == msgids::MSG_JOIN_STAGE_REQ => Some(Self::JoinStage),
            id if id == msgids::MSG_CREATE_JOIN_STAGE_REQ => Some(Self::CreateJoinStage),
            id if id == msgids::MSG_GET_OR_CREATE_STAGE_REQ => Some(Self::GetOrCreateStage),
            id if id == msgids::MSG_DESTROY_STAGE => Some(Self::DestroyStage),
            id if id == msgids::MSG_RECONNECT => Some(Self::Reconnect),
            id if id == msgids::MSG_DISCONNECT_NOTICE => Some(Self::DisconnectNotice),
            _ => None,
        }
    }

    pub fn reply_msg_id(self) -> Option<&'static str> {
        match self {
            Self::CreateStage => Some(msgids::MSG_CREATE_STAGE_RES),
            Self::JoinStage => Some(msgids::MSG_JOIN_STAGE_RES),
            Self::CreateJoinStage => Some(msgids::MSG_CREATE_JOIN_STAGE_RES),
            Self::GetOrCreateStage => Some(msgids::MSG_GET_OR_CREATE_STAGE_RES),
            Self::DestroyStage | Self::Reconnect | Self::DisconnectNotice => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_base_msg_ids() {
        assert_eq!(
            StageCommandKind::from_msg_id(msgids::MSG_CREATE_STAGE_REQ),
            Some(StageCommandKind::CreateStage)
        );
        assert_eq!(StageCommandKind::from_msg_id("NotACommand"), None);
    }
}
