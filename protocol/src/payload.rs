//! Reference-counted byte view with explicit ownership transfer (C1, §3).
//!
//! A `Payload` is one of three variants:
//! - `Pooled`: rented from the [`BufferPool`](crate::pool::BufferPool),
//!   returned on dispose.
//! - `Memory`: a borrowed/owned slice that doesn't participate in pooling;
//!   dispose is a no-op.
//! - `Empty`: nothing to hold; the state a payload is left in after
//!   `move_out()`.
//!
//! Invariant: exactly one disposer per pooled payload across its lifetime.
//! Passing a payload through a channel is a move, not a copy — `move_out()`
//! produces a new holder and leaves the source `Empty`.

use bytes::Bytes;

use crate::pool::PooledBuffer;

/// See the module docs.
pub enum Payload {
    Pooled(PooledBuffer),
    Memory(Bytes),
    Empty,
}

impl Payload {
    pub fn empty() -> Self {
        Payload::Empty
    }

    pub fn from_pooled(buffer: PooledBuffer) -> Self {
        Payload::Pooled(buffer)
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        Payload::Memory(bytes)
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Payload::Memory(Bytes::from(data))
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Pooled(buf) => buf.len(),
            Payload::Memory(bytes) => bytes.len(),
            Payload::Empty => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrows the current contents as a byte slice.
    pub fn span(&self) -> &[u8] {
        match self {
            Payload::Pooled(buf) => buf.as_slice(),
            Payload::Memory(bytes) => bytes.as_ref(),
            Payload::Empty => &[],
        }
    }

    /// Produces an owned `Bytes` view without consuming `self`. For
    /// `Pooled`, this copies the bytes (pooled storage cannot be shared by
    /// reference beyond the payload's own lifetime).
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Payload::Pooled(buf) => Bytes::copy_from_slice(buf.as_slice()),
            Payload::Memory(bytes) => bytes.clone(),
            Payload::Empty => Bytes::new(),
        }
    }

    /// Transfers ownership to a new holder, leaving `self` empty. This is
    /// the only sanctioned way to move a payload between a producer and a
    /// consumer without double-disposing the backing buffer.
    pub fn move_out(&mut self) -> Payload {
        std::mem::replace(self, Payload::Empty)
    }

    /// Explicit dispose. For `Pooled`, returns the buffer to the pool
    /// (via `PooledBuffer`'s `Drop`); for `Memory`/`Empty` this is a no-op.
    /// Safe to call more than once — a payload already disposed is already
    /// `Empty`, and disposing `Empty` does nothing.
    pub fn dispose(&mut self) {
        *self = Payload::Empty;
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BufferPool, PoolConfig};

    #[test]
    fn move_out_leaves_source_empty() {
        let mut payload = Payload::from_vec(vec![1, 2, 3]);
        let moved = payload.move_out();
        assert!(payload.is_empty());
        assert_eq!(moved.span(), &[1, 2, 3]);
    }

    #[test]
    fn double_dispose_is_a_no_op() {
        let mut payload = Payload::from_vec(vec![1, 2, 3]);
        payload.dispose();
        assert!(payload.is_empty());
        payload.dispose();
        assert!(payload.is_empty());
    }

    #[test]
    fn move_then_dispose_of_moved_from_is_a_no_op() {
        let pool = BufferPool::new(PoolConfig::default());
        let buf = pool.rent(64);
        let mut payload = Payload::from_pooled(buf);
        let mut moved = payload.move_out();
        payload.dispose(); // Moved-from: no-op, no double return.
        moved.dispose(); // Releases the pooled buffer exactly once.
    }
}
