//! Live countdown while a lifecycle is pending

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Receives countdown updates for a pending lifecycle
pub trait ProgressSink: Send + Sync {
    /// Called once per tick with the time left in the budget
    fn countdown(&self, operation: &'static str, remaining: Duration);

    /// Called once after the last countdown, when the emitter has stopped
    fn finish(&self, _operation: &'static str) {}
}

/// Rewrites a single stderr line: "Transaction times out in: N seconds"
#[derive(Default)]
pub struct TerminalCountdown {
    dirty: AtomicBool,
}

impl ProgressSink for TerminalCountdown {
    fn countdown(&self, _operation: &'static str, remaining: Duration) {
        let mut stderr = std::io::stderr().lock();
        let _ = write!(
            stderr,
            "\r\x1b[2KTransaction times out in: {} seconds",
            remaining.as_secs()
        );
        let _ = stderr.flush();
        self.dirty.store(true, Ordering::Relaxed);
    }

    fn finish(&self, _operation: &'static str) {
        if self.dirty.swap(false, Ordering::Relaxed) {
            let _ = writeln!(std::io::stderr());
        }
    }
}

/// Countdown as debug events, for non-interactive runs
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn countdown(&self, operation: &'static str, remaining: Duration) {
        debug!(
            operation,
            remaining_secs = remaining.as_secs(),
            "Transaction pending"
        );
    }
}

/// Periodic countdown task scoped to one lifecycle.
///
/// Ticks are measured from the instant the lifecycle started, the same
/// instant its deadline is computed from.
///
/// `stop` joins the task, so no countdown is emitted after it returns.
/// Dropping the emitter without `stop` aborts the task.
pub(crate) struct ProgressEmitter {
    operation: &'static str,
    sink: Arc<dyn ProgressSink>,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressEmitter {
    pub(crate) fn start(
        operation: &'static str,
        started: Instant,
        budget: Duration,
        tick: Duration,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task_sink = sink.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(next_tick(started, tick), tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let remaining = budget.saturating_sub(started.elapsed());
                        if remaining.is_zero() {
                            break;
                        }
                        task_sink.countdown(operation, remaining);
                    }
                }
            }
        });

        Self {
            operation,
            sink,
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Stop emitting and wait for the task to finish
    pub(crate) async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!("Progress sink for {} panicked: {}", self.operation, e);
                }
            }
        }
        self.sink.finish(self.operation);
    }
}

/// First tick boundary after now, counted from `started`
fn next_tick(started: Instant, tick: Duration) -> Instant {
    let passed = started.elapsed().as_nanos() / tick.as_nanos();
    let ticks = u32::try_from(passed + 1).unwrap_or(u32::MAX);
    started + tick.saturating_mul(ticks)
}

impl Drop for ProgressEmitter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
