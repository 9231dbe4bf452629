//! Request/reply correlation cache (C4, §4.4). Maps `msgSeq -> waiter` for
//! a single sender (one cache per C7 sender facade instance, typically one
//! per server/stage-worker-set). Completion is exactly-once: reply,
//! timeout, or disconnect, whichever happens first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use protocol::header::Header;
use protocol::payload::Payload;

use crate::error::CoreError;

/// The outcome of a request registered with [`RequestCache`]. Exactly one
/// of these is ever delivered per registered `msgSeq` (§8).
#[derive(Debug)]
pub enum RequestOutcome {
    Reply { header: Header, payload: Payload },
    Timeout,
    Disconnected,
}

impl RequestOutcome {
    pub fn into_result(self) -> Result<(Header, Payload), CoreError> {
        match self {
            RequestOutcome::Reply { header, payload } => Ok((header, payload)),
            RequestOutcome::Timeout => Err(CoreError::RequestTimeout(0)),
            RequestOutcome::Disconnected => Err(CoreError::Disconnected),
        }
    }
}

struct Entry {
    deadline: Instant,
    completion: oneshot::Sender<RequestOutcome>,
}

/// Running counters surfaced for diagnostics; late replies are dropped
/// silently per spec but counted here so operators can see it happening.
#[derive(Debug, Default)]
pub struct RequestCacheStats {
    pub completed: AtomicU64,
    pub timed_out: AtomicU64,
    pub disconnected: AtomicU64,
    pub late_replies_dropped: AtomicU64,
}

pub struct RequestCache {
    entries: Mutex<HashMap<u16, Entry>>,
    next_seq: AtomicU16,
    default_timeout: Duration,
    stats: RequestCacheStats,
}

impl RequestCache {
    pub fn new(default_timeout: Duration) -> Self {
        RequestCache {
            entries: Mutex::new(HashMap::new()),
            // Start at 1: 0 is reserved for one-way messages.
            next_seq: AtomicU16::new(1),
            default_timeout,
            stats: RequestCacheStats::default(),
        }
    }

    pub fn stats(&self) -> &RequestCacheStats {
        &self.stats
    }

    /// Allocates the next `msgSeq`, skipping 0. Fails fast if the in-flight
    /// window has wrapped all the way around without the previous holder
    /// of this sequence completing — that is a caller bug (too many
    /// concurrent requests for a 16-bit sequence space), not a runtime
    /// condition to recover from silently.
    fn allocate_seq(&self) -> u16 {
        loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
            // Wrapped past u16::MAX back to 0; skip it and try again.
        }
    }

    /// Registers a new outstanding request with a specific deadline,
    /// returning the allocated `msgSeq` and a receiver that completes
    /// exactly once.
    pub fn register(&self, timeout: Option<Duration>) -> (u16, oneshot::Receiver<RequestOutcome>) {
        let seq = self.allocate_seq();
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout.unwrap_or(self.default_timeout);
        let mut entries = self.entries.lock().expect("request cache poisoned");
        if entries.contains_key(&seq) {
            // The 16-bit sequence space wrapped around a still-outstanding
            // request. This is exactly the fail-fast precondition from
            // §4.4: too many in-flight requests for this sender.
            panic!("msgSeq {seq} collides with a still-outstanding request");
        }
        entries.insert(seq, Entry { deadline, completion: tx });
        (seq, rx)
    }

    /// Completes the waiter for `header.msgSeq()` with the reply, if one
    /// is still registered. A reply for a `msgSeq` with no waiter (already
    /// timed out, already completed, or never registered) is a late
    /// arrival and is dropped (§9 open question: drop, not push).
    pub fn try_complete(&self, header: Header, payload: Payload) {
        let seq = header.msg_seq();
        let entry = {
            let mut entries = self.entries.lock().expect("request cache poisoned");
            entries.remove(&seq)
        };
        match entry {
            Some(entry) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                let _ = entry.completion.send(RequestOutcome::Reply { header, payload });
            }
            None => {
                self.stats.late_replies_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(msg_seq = seq, "dropped late reply with no waiter");
            }
        }
    }

    /// Immediately fails a single registered entry (e.g. the underlying
    /// send could not even be enqueued). A no-op if the entry already
    /// completed or was never registered.
    pub fn fail(&self, seq: u16, outcome: RequestOutcome) {
        let entry = {
            let mut entries = self.entries.lock().expect("request cache poisoned");
            entries.remove(&seq)
        };
        if let Some(entry) = entry {
            let _ = entry.completion.send(outcome);
        }
    }

    /// Completes every outstanding waiter with `Disconnected`. Called when
    /// the owning session/connection goes away so no waiter is left
    /// hanging past its deadline.
    pub fn complete_all_disconnected(&self) {
        let drained: Vec<Entry> = {
            let mut entries = self.entries.lock().expect("request cache poisoned");
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            self.stats.disconnected.fetch_add(1, Ordering::Relaxed);
            let _ = entry.completion.send(RequestOutcome::Disconnected);
        }
    }

    /// Removes and times out every entry whose deadline has passed.
    /// Intended to run on a periodic interval from the owning server's
    /// maintenance task.
    pub fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<Entry> = {
            let mut entries = self.entries.lock().expect("request cache poisoned");
            let expired_seqs: Vec<u16> = entries
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(seq, _)| *seq)
                .collect();
            expired_seqs
                .into_iter()
                .filter_map(|seq| entries.remove(&seq))
                .collect()
        };
        if !expired.is_empty() {
            warn!(count = expired.len(), "sweeping timed-out requests");
        }
        for entry in expired {
            self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
            let _ = entry.completion.send(RequestOutcome::Timeout);
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.entries.lock().expect("request cache poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_completes_registered_waiter() {
        let cache = RequestCache::new(Duration::from_secs(5));
        let (seq, rx) = cache.register(None);
        let header = Header::new("EchoRes", seq, 0, 0).unwrap();
        cache.try_complete(header, Payload::from_vec(b"hi".to_vec()));
        let outcome = rx.await.unwrap();
        let (_, payload) = outcome.into_result().unwrap();
        assert_eq!(payload.span(), b"hi");
    }

    #[tokio::test]
    async fn late_reply_with_no_waiter_is_dropped() {
        let cache = RequestCache::new(Duration::from_secs(5));
        let header = Header::new("EchoRes", 42, 0, 0).unwrap();
        cache.try_complete(header, Payload::empty());
        assert_eq!(cache.stats().late_replies_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn sweep_times_out_expired_entries() {
        let cache = RequestCache::new(Duration::from_millis(1));
        let (_, rx) = cache.register(None);
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.sweep();
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, RequestOutcome::Timeout));
    }

    #[tokio::test]
    async fn reply_after_sweep_is_dropped_not_pushed() {
        let cache = RequestCache::new(Duration::from_millis(1));
        let (seq, rx) = cache.register(None);
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.sweep();
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, RequestOutcome::Timeout));

        let header = Header::new("LateRes", seq, 0, 0).unwrap();
        cache.try_complete(header, Payload::empty());
        assert_eq!(cache.stats().late_replies_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn disconnect_completes_all_outstanding() {
        let cache = RequestCache::new(Duration::from_secs(5));
        let (_, rx1) = cache.register(None);
        let (_, rx2) = cache.register(None);
        cache.complete_all_disconnected();
        assert!(matches!(rx1.await.unwrap(), RequestOutcome::Disconnected));
        assert!(matches!(rx2.await.unwrap(), RequestOutcome::Disconnected));
    }
}
