//! Per-stage timer subsystem (§4.9 "Timer subsystem"). Every fire posts a
//! `TimerTick` into the owning stage's mailbox, so timer callbacks run
//! under the same mutual exclusion as everything else in the stage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;

use super::MailboxMessage;

#[derive(Debug, Clone, Copy)]
pub enum TimerMode {
    Repeat { period: Duration },
    Count { period: Duration, count: u32 },
}

pub struct TimerSet {
    next_id: AtomicU64,
    handles: Mutex<HashMap<u64, AbortHandle>>,
}

impl TimerSet {
    pub fn new() -> Self {
        TimerSet {
            next_id: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Schedules a new timer, returning its stage-unique id.
    pub fn start(
        &self,
        mailbox: UnboundedSender<MailboxMessage>,
        initial_delay: Duration,
        mode: TimerMode,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let join = tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            match mode {
                TimerMode::Repeat { period } => loop {
                    if mailbox.send(MailboxMessage::TimerTick { timer_id: id }).is_err() {
                        break;
                    }
                    tokio::time::sleep(period).await;
                },
                TimerMode::Count { period, count } => {
                    for _ in 0..count {
                        if mailbox.send(MailboxMessage::TimerTick { timer_id: id }).is_err() {
                            break;
                        }
                        tokio::time::sleep(period).await;
                    }
                }
            }
        });
        self.handles.lock().expect("timer set poisoned").insert(id, join.abort_handle());
        id
    }

    /// Cancels a timer. Returns `false` if the id is unknown (already
    /// fired to completion or already cancelled).
    pub fn cancel(&self, id: u64) -> bool {
        let handle = self.handles.lock().expect("timer set poisoned").remove(&id);
        match handle {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels every outstanding timer, used by `CloseStage`.
    pub fn cancel_all(&self) {
        let handles: Vec<AbortHandle> = self
            .handles
            .lock()
            .expect("timer set poisoned")
            .drain()
            .map(|(_, h)| h)
            .collect();
        for handle in handles {
            handle.abort();
        }
    }
}

impl Default for TimerSet {
    fn default() -> Self {
        Self::new()
    }
}
