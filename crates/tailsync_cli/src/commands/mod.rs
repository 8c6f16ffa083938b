//! Subcommand implementations.

pub mod offset;
pub mod pull;
pub mod push;
pub mod serve;

use crate::config::LoopSettings;
use tailsync_engine::{RunSummary, Scheduler, StopSignal, Supervisor, SyncError, SyncResult};
use tracing::info;

/// Raises `stop` on Ctrl-C so the current cycle finishes before exit.
pub(crate) fn stop_on_interrupt() -> Result<StopSignal, ctrlc::Error> {
    let stop = StopSignal::new();
    let handle = stop.clone();
    ctrlc::set_handler(move || {
        info!("interrupt received; stopping after the current cycle");
        handle.stop();
    })?;
    Ok(stop)
}

/// Builds the supervisor that drives a producer or consumer.
pub(crate) fn supervisor(settings: &LoopSettings, stop: StopSignal) -> Supervisor {
    let mut scheduler = Scheduler::new(settings.interval).with_stop_signal(stop);
    if let Some(max) = settings.max_cycles {
        scheduler = scheduler.with_max_cycles(max);
    }
    Supervisor::new(scheduler, settings.retry.clone())
}

/// Logs how a loop ended. A stop request is a clean exit.
pub(crate) fn finish(name: &str, result: SyncResult<RunSummary>) -> SyncResult<()> {
    match result {
        Ok(summary) => {
            info!(
                cycles = summary.cycles,
                transfers = summary.transfers,
                bytes = summary.bytes,
                stopped = summary.stopped,
                "{name} finished"
            );
            Ok(())
        }
        Err(SyncError::Cancelled) => {
            info!("{name} cancelled");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
