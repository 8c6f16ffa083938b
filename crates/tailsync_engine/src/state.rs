//! Loop phases, cycle reports and statistics.

use std::time::{Duration, Instant};

/// Where a producer is within its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerPhase {
    /// Between cycles.
    Idle,
    /// Measuring the source file.
    Measure,
    /// Copying the delta into staging.
    Extract,
    /// Appending the staged delta to the remote file.
    Transfer,
    /// Persisting the new watermark.
    Commit,
    /// The last cycle failed.
    Failed,
}

impl ProducerPhase {
    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        !matches!(self, ProducerPhase::Idle | ProducerPhase::Failed)
    }
}

/// Where a consumer is within its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerPhase {
    /// Between cycles.
    Idle,
    /// Asking the remote endpoint for the file size.
    Probe,
    /// Comparing the remote size to the watermark.
    Decide,
    /// Opening the retrieval stream.
    Fetch,
    /// Appending received bytes to the destination.
    Append,
    /// Persisting the new watermark.
    Commit,
    /// The last cycle failed.
    Failed,
}

impl ConsumerPhase {
    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        !matches!(self, ConsumerPhase::Idle | ConsumerPhase::Failed)
    }
}

/// What a single cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Bytes were moved and the watermark advanced.
    Transferred {
        /// Bytes moved.
        bytes: u64,
    },
    /// Nothing new; the watermark did not change.
    UpToDate,
}

/// Result of a sync cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// What happened.
    pub outcome: CycleOutcome,
    /// Watermark after the cycle.
    pub watermark: u64,
    /// Duration of the cycle.
    pub duration: Duration,
}

impl CycleReport {
    /// Bytes moved by the cycle.
    pub fn bytes(&self) -> u64 {
        match self.outcome {
            CycleOutcome::Transferred { bytes } => bytes,
            CycleOutcome::UpToDate => 0,
        }
    }

    /// Returns true if the watermark advanced.
    pub fn transferred(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Transferred { .. })
    }
}

/// Statistics about a loop.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles completed without error.
    pub cycles_completed: u64,
    /// Cycles that found nothing to do.
    pub idle_cycles: u64,
    /// Total bytes moved.
    pub bytes_transferred: u64,
    /// When the last cycle finished.
    pub last_cycle_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

impl SyncStats {
    pub(crate) fn record(&mut self, report: &CycleReport) {
        self.cycles_completed += 1;
        match report.outcome {
            CycleOutcome::Transferred { bytes } => self.bytes_transferred += bytes,
            CycleOutcome::UpToDate => self.idle_cycles += 1,
        }
        self.last_cycle_time = Some(Instant::now());
    }
}
