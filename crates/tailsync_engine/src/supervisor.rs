//! Whole-loop restarts.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use crate::scheduler::{RunSummary, Scheduler, SyncLoop};
use tracing::{error, info, warn};

/// Rebuilds a failed loop from scratch.
///
/// Restarts happen only between runs: a failed cycle is never retried in
/// place. Each restart goes through the factory, so it reconnects and
/// re-reads the persisted watermark exactly as a fresh process would.
#[derive(Debug, Clone)]
pub struct Supervisor {
    retry: RetryConfig,
    scheduler: Scheduler,
}

impl Supervisor {
    /// Creates a supervisor.
    pub fn new(scheduler: Scheduler, retry: RetryConfig) -> Self {
        Self { retry, scheduler }
    }

    /// Returns the scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Builds a loop with `factory` and runs it, rebuilding after
    /// retryable failures until the retry budget is spent.
    ///
    /// The budget resets whenever a run completes at least one cycle, so a
    /// long-lived loop survives occasional outages.
    pub fn run<L, F>(&self, mut factory: F) -> SyncResult<RunSummary>
    where
        L: SyncLoop,
        F: FnMut() -> SyncResult<L>,
    {
        let stop = self.scheduler.stop_signal();
        let mut summary = RunSummary::default();
        let mut failures = 0u32;

        loop {
            let cycles_before = summary.cycles;
            let result = factory().and_then(|mut sync_loop| {
                match self.scheduler.run_with(&mut sync_loop, &mut summary) {
                    Ok(()) => sync_loop.shutdown(),
                    Err(e) => {
                        if let Err(close_err) = sync_loop.shutdown() {
                            warn!(error = %close_err, "shutdown after failure also failed");
                        }
                        Err(e)
                    }
                }
            });

            let err = match result {
                Ok(()) => return Ok(summary),
                Err(e) => e,
            };

            if summary.cycles > cycles_before {
                failures = 0;
            }
            failures += 1;

            if !err.is_retryable() || failures >= self.retry.max_attempts {
                error!(error = %err, attempts = failures, "sync loop failed");
                return Err(err);
            }

            let delay = self.retry.delay_for_attempt(failures);
            warn!(
                error = %err,
                attempt = failures,
                max_attempts = self.retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "sync loop failed; restarting"
            );
            if stop.wait_timeout(delay) {
                return Err(SyncError::Cancelled);
            }
            info!("restarting sync loop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Operation;
    use crate::state::{CycleOutcome, CycleReport};
    use std::time::Duration;
    use tailsync_protocol::ErrorCode;

    /// Fails with the given errors on successive builds, then succeeds.
    struct Flaky {
        error: Option<SyncError>,
    }

    impl SyncLoop for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn run_cycle(&mut self) -> SyncResult<CycleReport> {
            match self.error.take() {
                Some(e) => Err(e),
                None => Ok(CycleReport {
                    outcome: CycleOutcome::UpToDate,
                    watermark: 0,
                    duration: Duration::ZERO,
                }),
            }
        }

        fn shutdown(&mut self) -> SyncResult<()> {
            Ok(())
        }
    }

    fn fast_retry(attempts: u32) -> RetryConfig {
        RetryConfig::new(attempts)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false)
    }

    #[test]
    fn default_policy_is_fatal() {
        let supervisor = Supervisor::new(
            Scheduler::new(Duration::ZERO).with_max_cycles(1),
            RetryConfig::default(),
        );
        let mut builds = 0;
        let err = supervisor
            .run(|| {
                builds += 1;
                Ok(Flaky {
                    error: Some(SyncError::connectivity(Operation::Size, "down")),
                })
            })
            .unwrap_err();

        assert!(matches!(err, SyncError::Connectivity { .. }));
        assert_eq!(builds, 1);
    }

    #[test]
    fn retryable_failure_rebuilds_loop() {
        let supervisor = Supervisor::new(
            Scheduler::new(Duration::ZERO).with_max_cycles(2),
            fast_retry(3),
        );
        let mut builds = 0;
        let summary = supervisor
            .run(|| {
                builds += 1;
                let error = (builds == 1).then(|| SyncError::Timeout {
                    operation: Operation::Retrieve,
                });
                Ok(Flaky { error })
            })
            .unwrap();

        assert_eq!(builds, 2);
        assert_eq!(summary.cycles, 2);
    }

    #[test]
    fn non_retryable_failure_aborts() {
        let supervisor = Supervisor::new(
            Scheduler::new(Duration::ZERO).with_max_cycles(1),
            fast_retry(5),
        );
        let mut builds = 0;
        let err = supervisor
            .run(|| {
                builds += 1;
                Err::<Flaky, _>(SyncError::WatermarkAhead {
                    watermark: 9,
                    size: 1,
                })
            })
            .unwrap_err();

        assert!(matches!(err, SyncError::WatermarkAhead { .. }));
        assert_eq!(builds, 1);
    }

    #[test]
    fn rejected_path_is_not_retried() {
        let supervisor = Supervisor::new(
            Scheduler::new(Duration::ZERO).with_max_cycles(1),
            fast_retry(5),
        );
        let mut builds = 0;
        let err = supervisor
            .run(|| {
                builds += 1;
                Ok(Flaky {
                    error: Some(SyncError::rejected(
                        Operation::Append,
                        ErrorCode::InvalidPath,
                        "../escape.txt",
                    )),
                })
            })
            .unwrap_err();

        assert!(matches!(err, SyncError::RemoteOperation { transient: false, .. }));
        assert_eq!(builds, 1);
    }

    #[test]
    fn budget_exhausted() {
        let supervisor = Supervisor::new(
            Scheduler::new(Duration::ZERO).with_max_cycles(1),
            fast_retry(3),
        );
        let mut builds = 0;
        let result = supervisor.run(|| {
            builds += 1;
            Err::<Flaky, _>(SyncError::connectivity(Operation::Connect, "refused"))
        });

        assert!(result.is_err());
        assert_eq!(builds, 3);
    }
}
