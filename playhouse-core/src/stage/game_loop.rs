//! Fixed-timestep game loop (C11, §4.9 "Game loop"). Runs on a dedicated
//! background thread, never on the async task pool, since its wait
//! discipline (sleep-then-spin) would otherwise starve the cooperative
//! scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use super::MailboxMessage;

const SPIN_THRESHOLD: Duration = Duration::from_millis(2);
const STOP_JOIN_BUDGET: Duration = Duration::from_secs(2);

pub struct GameLoopHandle {
    running: Arc<AtomicBool>,
    thread_id: ThreadId,
    join: Option<std::thread::JoinHandle<()>>,
}

impl GameLoopHandle {
    /// Starts ticking. One fixed-dt tick is posted into `mailbox` for
    /// every `fixed_timestep` of accumulated wall-clock time; the
    /// accumulator is capped at `effective_cap` to avoid a spiral of
    /// death after a stall.
    pub fn start(
        stage_id: i64,
        mailbox: UnboundedSender<MailboxMessage>,
        fixed_timestep: Duration,
        effective_cap: Duration,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let running_loop = running.clone();
        let effective_cap = effective_cap.max(fixed_timestep);

        let join = std::thread::Builder::new()
            .name(format!("game-loop-stage-{stage_id}"))
            .spawn(move || run_loop(mailbox, fixed_timestep, effective_cap, running_loop))
            .expect("spawn game loop thread");
        let thread_id = join.thread().id();

        GameLoopHandle {
            running,
            thread_id,
            join: Some(join),
        }
    }

    /// Stops the loop. Joins with a 2s budget unless called from the loop
    /// thread itself, in which case the join is skipped to avoid
    /// deadlocking on self-join.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if std::thread::current().id() == self.thread_id {
            debug!("game loop stop() called from its own thread, skipping self-join");
            return;
        }
        if let Some(handle) = self.join.take() {
            join_with_timeout(handle, STOP_JOIN_BUDGET);
        }
    }
}

impl Drop for GameLoopHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    mailbox: UnboundedSender<MailboxMessage>,
    fixed_timestep: Duration,
    effective_cap: Duration,
    running: Arc<AtomicBool>,
) {
    let mut accumulator = Duration::ZERO;
    let mut total_elapsed = Duration::ZERO;
    let mut last = Instant::now();

    while running.load(Ordering::Relaxed) {
        let now = Instant::now();
        let frame_time = now.duration_since(last);
        last = now;

        accumulator += frame_time;
        if accumulator > effective_cap {
            accumulator = effective_cap;
        }

        while accumulator >= fixed_timestep {
            total_elapsed += fixed_timestep;
            if mailbox
                .send(MailboxMessage::GameLoopTick {
                    delta: fixed_timestep,
                    total_elapsed,
                })
                .is_err()
            {
                return; // Stage mailbox gone; nothing left to tick for.
            }
            accumulator -= fixed_timestep;
            if !running.load(Ordering::Relaxed) {
                return;
            }
        }

        let remaining = fixed_timestep.saturating_sub(accumulator);
        if remaining > SPIN_THRESHOLD {
            std::thread::sleep(remaining - SPIN_THRESHOLD);
        }
        let spin_until = Instant::now() + remaining.min(SPIN_THRESHOLD);
        while Instant::now() < spin_until {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            std::hint::spin_loop();
        }
    }
}

fn join_with_timeout(handle: std::thread::JoinHandle<()>, timeout: Duration) {
    let (tx, rx) = std_mpsc::channel();
    let _ = std::thread::Builder::new()
        .name("game-loop-joiner".into())
        .spawn(move || {
            let _ = handle.join();
            let _ = tx.send(());
        });
    if rx.recv_timeout(timeout).is_err() {
        debug!("game loop thread did not stop within the stop budget");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_timestep_produces_ticks_within_expected_rate() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handle = GameLoopHandle::start(1, tx, Duration::from_millis(10), Duration::from_millis(50));

        let mut count = 0;
        let deadline = Instant::now() + Duration::from_millis(300);
        while Instant::now() < deadline {
            if tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_ok() {
                count += 1;
            }
        }
        handle.stop();
        // ~30 ticks expected over 300ms at 10ms/tick; allow generous slack
        // since CI scheduling jitter is real.
        assert!(count > 10, "expected at least 10 ticks, got {count}");
    }

    #[tokio::test]
    async fn accumulator_cap_below_timestep_is_clamped() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handle = GameLoopHandle::start(1, tx, Duration::from_millis(50), Duration::from_millis(10));
        // Internally effective_cap should have been clamped up to 50ms;
        // we can't observe the field directly but can confirm it doesn't
        // panic or spin forever by letting it run briefly.
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop();
    }
}
