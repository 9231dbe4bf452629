//! Packet header (§3). Immutable once constructed; route headers are
//! pooled and reset on return so a stale flag never leaks into the next
//! user of the slot (§5 "Route headers are pooled and must be fully reset
//! on return").

use crate::error::ModelError;
use crate::msgids::MAX_MSG_ID_LEN;

/// Client/server packet header. Construction validates the `msgId`
/// constraints from §3 (`1..=128` UTF-8 bytes); every other field is a
/// plain value type with no further invariants at this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    msg_id: String,
    msg_seq: u16,
    stage_id: i64,
    error_code: u16,
    is_base: bool,
    is_reply: bool,
    is_system: bool,
    is_backend: bool,
    from: String,
}

impl Header {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        msg_id: impl Into<String>,
        msg_seq: u16,
        stage_id: i64,
        error_code: u16,
    ) -> Result<Self, ModelError> {
        let msg_id = msg_id.into();
        if msg_id.is_empty() {
            return Err(ModelError::MsgIdEmpty);
        }
        if msg_id.len() > MAX_MSG_ID_LEN {
            return Err(ModelError::MsgIdTooLong(msg_id, MAX_MSG_ID_LEN));
        }
        Ok(Header {
            msg_id,
            msg_seq,
            stage_id,
            error_code,
            is_base: false,
            is_reply: false,
            is_system: false,
            is_backend: false,
            from: String::new(),
        })
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn msg_seq(&self) -> u16 {
        self.msg_seq
    }

    /// `0` means one-way/push (§3).
    pub fn is_one_way(&self) -> bool {
        self.msg_seq == 0
    }

    pub fn stage_id(&self) -> i64 {
        self.stage_id
    }

    pub fn error_code(&self) -> u16 {
        self.error_code
    }

    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }

    pub fn is_base(&self) -> bool {
        self.is_base
    }

    pub fn is_reply(&self) -> bool {
        self.is_reply
    }

    pub fn is_system(&self) -> bool {
        self.is_system
    }

    pub fn is_backend(&self) -> bool {
        self.is_backend
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    /// Builder-style setters. Headers are logically immutable once handed
    /// out to user code; these exist for the construction phase in C7's
    /// sender facade only.
    pub fn with_base(mut self, value: bool) -> Self {
        self.is_base = value;
        self
    }

    pub fn with_reply(mut self, value: bool) -> Self {
        self.is_reply = value;
        self
    }

    pub fn with_system(mut self, value: bool) -> Self {
        self.is_system = value;
        self
    }

    pub fn with_backend(mut self, value: bool) -> Self {
        self.is_backend = value;
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn with_error_code(mut self, error_code: u16) -> Self {
        self.error_code = error_code;
        self
    }

    /// Resets all flags cleared, for reuse by a pool. Any new boolean
    /// field added to `Header` must be cleared here too (§5 invariant).
    fn reset_flags(&mut self) {
        self.is_base = false;
        self.is_reply = false;
        self.is_system = false;
        self.is_backend = false;
        self.error_code = 0;
        self.from.clear();
    }
}

/// Pool of reusable route headers (inter-server headers carry `from`/`to`
/// plus the booleans above — the values that must be reset between uses).
/// This is a small, bounded free list; the headers themselves are cheap
/// (one `String` + scalars) so the pool mainly exists to make the reset
/// discipline explicit and centralized, matching §5's requirement.
pub struct HeaderPool {
    free: std::sync::Mutex<Vec<Header>>,
    capacity: usize,
}

impl HeaderPool {
    pub fn new(capacity: usize) -> Self {
        HeaderPool {
            free: std::sync::Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn take(&self, msg_id: impl Into<String>, msg_seq: u16, stage_id: i64) -> Header {
        let recycled = self.free.lock().ok().and_then(|mut free| free.pop());
        match recycled {
            Some(mut header) => {
                header.msg_id = msg_id.into();
                header.msg_seq = msg_seq;
                header.stage_id = stage_id;
                header
            }
            None => Header::new(msg_id, msg_seq, stage_id, 0)
                .expect("msgId constructed internally must be valid"),
        }
    }

    pub fn release(&self, mut header: Header) {
        header.reset_flags();
        if let Ok(mut free) = self.free.lock()
            && free.len() < self.capacity
        {
            free.push(header);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_oversized_msg_id() {
        assert!(Header::new("", 1, 0, 0).is_err());
        let too_long = "x".repeat(MAX_MSG_ID_LEN + 1);
        assert!(Header::new(too_long, 1, 0, 0).is_err());
    }

    #[test]
    fn pool_clears_all_booleans_on_release() {
        let pool = HeaderPool::new(4);
        let header = pool
            .take("Echo", 1, 42)
            .with_base(true)
            .with_reply(true)
            .with_system(true)
            .with_backend(true)
            .with_from("server-a");
        pool.release(header);

        let recycled = pool.take("Other", 2, 7);
        assert!(!recycled.is_base());
        assert!(!recycled.is_reply());
        assert!(!recycled.is_system());
        assert!(!recycled.is_backend());
        assert_eq!(recycled.from(), "");
        assert_eq!(recycled.error_code(), 0);
    }
}
