//! Download side: mirrors a growing remote file into a local one.

use crate::config::ConsumerConfig;
use crate::delta::{advance, needs_fetch, skip_prefix};
use crate::error::{Operation, SyncError, SyncResult};
use crate::scheduler::SyncLoop;
use crate::state::{ConsumerPhase, CycleOutcome, CycleReport, SyncStats};
use crate::transport::RemoteEndpoint;
use std::io::{self, Read};
use std::time::Instant;
use tailsync_storage::{OffsetStore, StorageBackend};
use tracing::{debug, info, warn};

/// Runs `PROBE -> DECIDE -> FETCH -> APPEND -> COMMIT` cycles.
pub struct Consumer<D, E, O>
where
    D: StorageBackend,
    E: RemoteEndpoint,
    O: OffsetStore,
{
    config: ConsumerConfig,
    destination: D,
    endpoint: E,
    offsets: O,
    watermark: u64,
    phase: ConsumerPhase,
    stats: SyncStats,
}

impl<D, E, O> Consumer<D, E, O>
where
    D: StorageBackend,
    E: RemoteEndpoint,
    O: OffsetStore,
{
    /// Creates a consumer, loading the watermark and reconciling the
    /// destination with it.
    ///
    /// A destination shorter than the watermark has lost data and is
    /// fatal. A longer one holds bytes from an append that was never
    /// committed; they are cut off when `truncate_on_resume` is set and
    /// kept (as an at-least-once duplicate) otherwise.
    pub fn new(
        config: ConsumerConfig,
        mut destination: D,
        endpoint: E,
        offsets: O,
    ) -> SyncResult<Self> {
        let watermark = offsets
            .read()
            .map_err(|e| SyncError::local(Operation::ReadWatermark, e))?;
        let size = destination
            .size()
            .map_err(|e| SyncError::local(Operation::Reconcile, e))?;

        if size < watermark {
            return Err(SyncError::WatermarkAhead { watermark, size });
        }
        if size > watermark {
            let extra = size - watermark;
            if config.truncate_on_resume {
                warn!(extra, watermark, "discarding uncommitted bytes from previous run");
                destination
                    .truncate(watermark)
                    .and_then(|()| destination.sync())
                    .map_err(|e| SyncError::local(Operation::Reconcile, e))?;
            } else {
                warn!(
                    extra,
                    watermark, "destination holds uncommitted bytes; they will be duplicated"
                );
            }
        }

        info!(
            remote_path = %config.remote_path,
            watermark,
            "consumer starting"
        );

        Ok(Self {
            config,
            destination,
            endpoint,
            offsets,
            watermark,
            phase: ConsumerPhase::Idle,
            stats: SyncStats::default(),
        })
    }

    /// Returns the in-memory watermark.
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Returns the current phase.
    pub fn phase(&self) -> ConsumerPhase {
        self.phase
    }

    /// Returns loop statistics.
    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Returns the remote endpoint.
    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// Runs one cycle.
    pub fn run_cycle(&mut self) -> SyncResult<CycleReport> {
        let result = self.cycle();
        match &result {
            Ok(report) => {
                self.phase = ConsumerPhase::Idle;
                self.stats.record(report);
            }
            Err(e) => {
                self.phase = ConsumerPhase::Failed;
                self.stats.last_error = Some(e.to_string());
            }
        }
        result
    }

    /// Closes the remote session.
    pub fn close(&mut self) -> SyncResult<()> {
        self.endpoint.close()
    }

    fn cycle(&mut self) -> SyncResult<CycleReport> {
        let started = Instant::now();
        let path = self.config.remote_path.as_str();

        self.phase = ConsumerPhase::Probe;
        let remote_size = match self.endpoint.size(path)? {
            Some(size) => size,
            None => {
                debug!(path, "remote file does not exist yet");
                0
            }
        };

        self.phase = ConsumerPhase::Decide;
        if !needs_fetch(remote_size, self.watermark) {
            info!(remote_size, watermark = self.watermark, "No new data to download.");
            return Ok(self.up_to_date(started));
        }

        self.phase = ConsumerPhase::Fetch;
        let mut stream = if self.config.range_reads {
            self.endpoint.retrieve_from(path, self.watermark)?
        } else {
            let mut stream = self.endpoint.retrieve(path)?;
            let skipped = skip_prefix(&mut *stream, self.watermark)
                .map_err(|e| SyncError::transport(Operation::Retrieve, e))?;
            debug!(skipped, "discarded already-mirrored prefix");
            stream
        };

        self.phase = ConsumerPhase::Append;
        let mut buf = vec![0u8; self.config.chunk_size];
        let mut received = 0u64;
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SyncError::transport(Operation::Retrieve, e)),
            };
            self.destination
                .append(&buf[..n])
                .map_err(|e| SyncError::local(Operation::LocalAppend, e))?;
            received += n as u64;
        }
        drop(stream);

        if received == 0 {
            // Stream ended before the watermark: the remote file shrank
            // between PROBE and FETCH.
            debug!(remote_size, watermark = self.watermark, "stream yielded no new bytes");
            return Ok(self.up_to_date(started));
        }

        self.destination
            .flush()
            .and_then(|()| self.destination.sync())
            .map_err(|e| SyncError::local(Operation::LocalAppend, e))?;

        self.phase = ConsumerPhase::Commit;
        let new_watermark = advance(self.watermark, received)?;
        self.offsets
            .write(new_watermark)
            .map_err(|e| SyncError::local(Operation::CommitWatermark, e))?;
        self.watermark = new_watermark;

        info!(
            bytes = received,
            watermark = self.watermark,
            "Downloaded {} bytes (new offset: {})",
            received,
            self.watermark
        );

        Ok(CycleReport {
            outcome: CycleOutcome::Transferred { bytes: received },
            watermark: self.watermark,
            duration: started.elapsed(),
        })
    }

    fn up_to_date(&self, started: Instant) -> CycleReport {
        CycleReport {
            outcome: CycleOutcome::UpToDate,
            watermark: self.watermark,
            duration: started.elapsed(),
        }
    }
}

impl<D, E, O> SyncLoop for Consumer<D, E, O>
where
    D: StorageBackend,
    E: RemoteEndpoint,
    O: OffsetStore,
{
    fn name(&self) -> &'static str {
        "consumer"
    }

    fn run_cycle(&mut self) -> SyncResult<CycleReport> {
        Consumer::run_cycle(self)
    }

    fn shutdown(&mut self) -> SyncResult<()> {
        self.close()
    }
}

impl<D, E, O> std::fmt::Debug for Consumer<D, E, O>
where
    D: StorageBackend,
    E: RemoteEndpoint,
    O: OffsetStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("config", &self.config)
            .field("watermark", &self.watermark)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}
