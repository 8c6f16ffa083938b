//! Fixed-interval polling.

use crate::error::SyncResult;
use crate::state::CycleReport;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A loop that can be driven one cycle at a time.
pub trait SyncLoop {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Runs one cycle. Any error is fatal to the loop.
    fn run_cycle(&mut self) -> SyncResult<CycleReport>;

    /// Releases remote resources after the last cycle.
    fn shutdown(&mut self) -> SyncResult<()>;
}

impl<L: SyncLoop + ?Sized> SyncLoop for Box<L> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn run_cycle(&mut self) -> SyncResult<CycleReport> {
        (**self).run_cycle()
    }

    fn shutdown(&mut self) -> SyncResult<()> {
        (**self).shutdown()
    }
}

/// A cancellation flag that can also wake a sleeping scheduler.
///
/// Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    /// Creates a signal that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal, waking every waiter.
    pub fn stop(&self) {
        let (flag, cond) = &*self.inner;
        *flag.lock() = true;
        cond.notify_all();
    }

    /// Returns true once the signal has fired.
    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleeps for `timeout` or until the signal fires.
    ///
    /// Returns true if the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cond) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut stopped = flag.lock();
        while !*stopped {
            if cond.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

/// Totals across the cycles a scheduler ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Cycles completed.
    pub cycles: u64,
    /// Cycles that moved bytes.
    pub transfers: u64,
    /// Bytes moved.
    pub bytes: u64,
    /// Whether the run ended because the stop signal fired.
    pub stopped: bool,
}

/// Drives a [`SyncLoop`] at a fixed interval.
///
/// The interval is measured from the end of one cycle to the start of the
/// next, so cycles never overlap.
#[derive(Debug, Clone)]
pub struct Scheduler {
    interval: Duration,
    max_cycles: Option<u64>,
    stop: StopSignal,
}

impl Scheduler {
    /// Creates a scheduler that runs until stopped.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_cycles: None,
            stop: StopSignal::new(),
        }
    }

    /// Stops after `cycles` cycles.
    pub fn with_max_cycles(mut self, cycles: u64) -> Self {
        self.max_cycles = Some(cycles);
        self
    }

    /// Uses an existing stop signal.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Returns a handle that stops this scheduler.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Returns the polling interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs cycles until the stop signal fires, the cycle limit is reached,
    /// or a cycle fails.
    pub fn run<L: SyncLoop + ?Sized>(&self, sync_loop: &mut L) -> SyncResult<RunSummary> {
        let mut summary = RunSummary::default();
        self.run_with(sync_loop, &mut summary)?;
        Ok(summary)
    }

    /// Like [`Scheduler::run`], accumulating into `summary` so progress
    /// survives a failed run. The cycle limit applies to the accumulated
    /// count.
    pub fn run_with<L: SyncLoop + ?Sized>(
        &self,
        sync_loop: &mut L,
        summary: &mut RunSummary,
    ) -> SyncResult<()> {
        loop {
            if self.limit_reached(summary) {
                debug!(name = sync_loop.name(), cycles = summary.cycles, "cycle limit reached");
                return Ok(());
            }
            if self.stop.is_stopped() {
                summary.stopped = true;
                return Ok(());
            }

            let report = sync_loop.run_cycle()?;
            summary.cycles += 1;
            if report.transferred() {
                summary.transfers += 1;
                summary.bytes += report.bytes();
            }

            if self.limit_reached(summary) {
                continue;
            }
            if self.stop.wait_timeout(self.interval) {
                summary.stopped = true;
                debug!(name = sync_loop.name(), "stop requested");
                return Ok(());
            }
        }
    }

    fn limit_reached(&self, summary: &RunSummary) -> bool {
        self.max_cycles.is_some_and(|max| summary.cycles >= max)
    }
}
