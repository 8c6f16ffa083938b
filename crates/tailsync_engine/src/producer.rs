//! Upload side: ships new bytes of a growing local file to the remote end.

use crate::config::{ProducerConfig, Staging};
use crate::delta::Delta;
use crate::error::{Operation, SyncError, SyncResult};
use crate::heartbeat::HeartbeatWriter;
use crate::scheduler::SyncLoop;
use crate::state::{CycleOutcome, CycleReport, ProducerPhase, SyncStats};
use crate::transport::RemoteEndpoint;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::time::Instant;
use tailsync_storage::{OffsetStore, StorageBackend, StorageError};
use tracing::{debug, info};

/// Runs `MEASURE -> EXTRACT -> TRANSFER -> COMMIT` cycles.
///
/// The watermark only moves after the remote end has acknowledged the
/// append, so a crash can re-send at most the one delta that was in flight
/// and never loses bytes.
pub struct Producer<S, E, O>
where
    S: StorageBackend,
    E: RemoteEndpoint,
    O: OffsetStore,
{
    config: ProducerConfig,
    source: S,
    endpoint: E,
    offsets: O,
    watermark: u64,
    phase: ProducerPhase,
    stats: SyncStats,
    heartbeat: Option<HeartbeatWriter>,
}

impl<S, E, O> Producer<S, E, O>
where
    S: StorageBackend,
    E: RemoteEndpoint,
    O: OffsetStore,
{
    /// Creates a producer, loading the persisted watermark.
    ///
    /// Fails with [`SyncError::CorruptRecord`] before any transfer if the
    /// watermark record is unreadable.
    pub fn new(config: ProducerConfig, source: S, endpoint: E, offsets: O) -> SyncResult<Self> {
        let watermark = offsets
            .read()
            .map_err(|e| SyncError::local(Operation::ReadWatermark, e))?;
        info!(
            remote_path = %config.remote_path,
            watermark,
            "producer starting"
        );

        Ok(Self {
            config,
            source,
            endpoint,
            offsets,
            watermark,
            phase: ProducerPhase::Idle,
            stats: SyncStats::default(),
            heartbeat: None,
        })
    }

    /// Writes a heartbeat line into the source at the start of every cycle.
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatWriter) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Returns the in-memory watermark (equal to the persisted one between
    /// cycles).
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Returns the current phase.
    pub fn phase(&self) -> ProducerPhase {
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
                self.phase = ProducerPhase::Idle;
                self.stats.record(report);
            }
            Err(e) => {
                self.phase = ProducerPhase::Failed;
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

        if let Some(heartbeat) = &mut self.heartbeat {
            heartbeat
                .write_entry()
                .map_err(|e| SyncError::local(Operation::Heartbeat, e))?;
        }

        self.phase = ProducerPhase::Measure;
        let size = self
            .source
            .size()
            .map_err(|e| SyncError::local(Operation::Measure, e))?;
        let delta = Delta::between(self.watermark, size)?;

        if delta.is_empty() {
            debug!(watermark = self.watermark, "no new data to upload");
            return Ok(CycleReport {
                outcome: CycleOutcome::UpToDate,
                watermark: self.watermark,
                duration: started.elapsed(),
            });
        }

        self.phase = ProducerPhase::Extract;
        let mut staged = self.extract(&delta)?;

        self.phase = ProducerPhase::Transfer;
        let sent = self.endpoint.append(&self.config.remote_path, &mut staged)?;
        if sent != delta.len() {
            return Err(SyncError::remote(
                Operation::Append,
                format!("staged {} bytes but sent {sent}", delta.len()),
            ));
        }

        self.phase = ProducerPhase::Commit;
        self.offsets
            .write(delta.end)
            .map_err(|e| SyncError::local(Operation::CommitWatermark, e))?;
        self.watermark = delta.end;

        info!(
            bytes = sent,
            watermark = self.watermark,
            "Uploaded {} bytes (new offset: {})",
            sent,
            self.watermark
        );

        Ok(CycleReport {
            outcome: CycleOutcome::Transferred { bytes: sent },
            watermark: self.watermark,
            duration: started.elapsed(),
        })
    }

    fn extract(&self, delta: &Delta) -> SyncResult<Staged> {
        let mut staged = Staged::open(&self.config.staging, delta.len())?;
        for (offset, len) in delta.chunks(self.config.chunk_size) {
            let chunk = self
                .source
                .read_at(offset, len)
                .map_err(|e| SyncError::local(Operation::Extract, e))?;
            staged.write_all(&chunk).map_err(extract_io)?;
        }
        staged.rewind().map_err(extract_io)?;
        Ok(staged)
    }
}

impl<S, E, O> SyncLoop for Producer<S, E, O>
where
    S: StorageBackend,
    E: RemoteEndpoint,
    O: OffsetStore,
{
    fn name(&self) -> &'static str {
        "producer"
    }

    fn run_cycle(&mut self) -> SyncResult<CycleReport> {
        Producer::run_cycle(self)
    }

    fn shutdown(&mut self) -> SyncResult<()> {
        self.close()
    }
}

impl<S, E, O> std::fmt::Debug for Producer<S, E, O>
where
    S: StorageBackend,
    E: RemoteEndpoint,
    O: OffsetStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("config", &self.config)
            .field("watermark", &self.watermark)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

fn extract_io(err: io::Error) -> SyncError {
    SyncError::local(Operation::Extract, StorageError::Io(err))
}

/// A delta held between EXTRACT and TRANSFER.
enum Staged {
    Memory(Cursor<Vec<u8>>),
    File(File),
}

impl Staged {
    fn open(staging: &Staging, len: u64) -> SyncResult<Self> {
        match staging {
            Staging::Memory => {
                let capacity = usize::try_from(len).unwrap_or(0);
                Ok(Staged::Memory(Cursor::new(Vec::with_capacity(capacity))))
            }
            Staging::TempFile { dir } => {
                let file = match dir {
                    Some(dir) => tempfile::tempfile_in(dir),
                    None => tempfile::tempfile(),
                }
                .map_err(extract_io)?;
                Ok(Staged::File(file))
            }
        }
    }

    fn rewind(&mut self) -> io::Result<()> {
        match self {
            Staged::Memory(cursor) => cursor.set_position(0),
            Staged::File(file) => {
                file.flush()?;
                file.seek(SeekFrom::Start(0))?;
            }
        }
        Ok(())
    }
}

impl Read for Staged {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Staged::Memory(cursor) => cursor.read(buf),
            Staged::File(file) => file.read(buf),
        }
    }
}

impl Write for Staged {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Staged::Memory(cursor) => cursor.write(buf),
            Staged::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Staged::Memory(cursor) => cursor.flush(),
            Staged::File(file) => file.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryEndpoint, MemoryRemote};
    use tailsync_storage::{InMemoryBackend, MemoryOffsetStore};

    const PATH: &str = "/shared/file1.txt";

    fn producer(
        source: &InMemoryBackend,
        remote: &MemoryRemote,
        offsets: &MemoryOffsetStore,
        config: ProducerConfig,
    ) -> Producer<InMemoryBackend, MemoryEndpoint, MemoryOffsetStore> {
        Producer::new(
            config,
            source.clone(),
            remote.connect().unwrap(),
            offsets.clone(),
        )
        .unwrap()
    }

    #[test]
    fn first_cycle_ships_everything() {
        let mut source = InMemoryBackend::new();
        let remote = MemoryRemote::new();
        let offsets = MemoryOffsetStore::new();
        let mut producer = producer(&source, &remote, &offsets, ProducerConfig::new(PATH));

        source.append(b"hello").unwrap();
        let report = producer.run_cycle().unwrap();

        assert_eq!(report.bytes(), 5);
        assert_eq!(remote.file(PATH).unwrap(), b"hello");
        assert_eq!(offsets.raw().unwrap(), b"5");
        assert_eq!(producer.phase(), ProducerPhase::Idle);
    }

    #[test]
    fn resumes_from_watermark() {
        let source = InMemoryBackend::with_data(b"helloworld".to_vec());
        let remote = MemoryRemote::new();
        remote.put(PATH, b"hello".to_vec());
        let offsets = MemoryOffsetStore::with_content("5");
        let mut producer = producer(&source, &remote, &offsets, ProducerConfig::new(PATH));

        let report = producer.run_cycle().unwrap();
        assert_eq!(report.bytes(), 5);
        assert_eq!(remote.file(PATH).unwrap(), b"helloworld");
        assert_eq!(producer.watermark(), 10);
    }

    #[test]
    fn empty_delta_skips_transfer_and_commit() {
        let source = InMemoryBackend::with_data(b"abc".to_vec());
        let remote = MemoryRemote::new();
        let offsets = MemoryOffsetStore::with_content("3");
        let mut producer = producer(&source, &remote, &offsets, ProducerConfig::new(PATH));

        let report = producer.run_cycle().unwrap();
        assert_eq!(report.outcome, CycleOutcome::UpToDate);
        assert_eq!(remote.calls().append, 0);
        assert_eq!(offsets.raw().unwrap(), b"3");
        assert_eq!(producer.stats().idle_cycles, 1);
    }

    #[test]
    fn corrupt_watermark_fails_before_transfer() {
        let source = InMemoryBackend::with_data(b"abc".to_vec());
        let remote = MemoryRemote::new();
        let offsets = MemoryOffsetStore::with_content("abc");

        let err = Producer::new(
            ProducerConfig::new(PATH),
            source,
            remote.connect().unwrap(),
            offsets,
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::CorruptRecord { .. }));
        assert_eq!(remote.calls(), Default::default());
    }

    #[test]
    fn shrunk_source_is_fatal() {
        let source = InMemoryBackend::with_data(b"abc".to_vec());
        let remote = MemoryRemote::new();
        let offsets = MemoryOffsetStore::with_content("10");
        let mut producer = producer(&source, &remote, &offsets, ProducerConfig::new(PATH));

        let err = producer.run_cycle().unwrap_err();
        assert!(matches!(
            err,
            SyncError::WatermarkAhead {
                watermark: 10,
                size: 3
            }
        ));
        assert_eq!(producer.phase(), ProducerPhase::Failed);
        assert!(producer.stats().last_error.is_some());
    }

    #[test]
    fn failed_transfer_keeps_watermark() {
        let source = InMemoryBackend::with_data(b"hello".to_vec());
        let remote = MemoryRemote::new();
        let offsets = MemoryOffsetStore::new();
        let mut producer = producer(&source, &remote, &offsets, ProducerConfig::new(PATH));

        remote.fail_next(Operation::Append);
        let err = producer.run_cycle().unwrap_err();
        assert!(matches!(err, SyncError::RemoteOperation { .. }));
        assert_eq!(producer.watermark(), 0);
        assert_eq!(offsets.raw(), None);
    }

    #[test]
    fn temp_file_staging_in_small_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let source = InMemoryBackend::with_data(data.clone());
        let remote = MemoryRemote::new();
        let offsets = MemoryOffsetStore::new();
        let config = ProducerConfig::new(PATH)
            .with_staging(Staging::TempFile {
                dir: Some(dir.path().to_path_buf()),
            })
            .with_chunk_size(7);
        let mut producer = producer(&source, &remote, &offsets, config);

        producer.run_cycle().unwrap();
        assert_eq!(remote.file(PATH).unwrap(), data);
    }

    #[test]
    fn heartbeat_is_shipped_in_same_cycle() {
        let source = InMemoryBackend::new();
        let remote = MemoryRemote::new();
        let offsets = MemoryOffsetStore::new();
        let mut producer = producer(&source, &remote, &offsets, ProducerConfig::new(PATH))
            .with_heartbeat(HeartbeatWriter::new(source.clone()));

        let report = producer.run_cycle().unwrap();
        assert!(report.transferred());

        let shipped = String::from_utf8(remote.file(PATH).unwrap()).unwrap();
        assert!(shipped.starts_with("Log entry at "));
        assert_eq!(shipped.as_bytes(), source.data().as_slice());
    }
}
