//! Crash injection for sync loops.
//!
//! A loop can die at any point of a cycle. The watermark is only written
//! after the bytes are durable on the other side, so a crash can duplicate
//! the delta of the interrupted cycle but can never lose bytes. The
//! wrappers here fail a remote call or a watermark write on demand, and the
//! harness checks that a restarted loop converges with at most that one
//! delta duplicated.
//!
//! ## Usage
//!
//! ```rust
//! use tailsync_testkit::crash::{CrashPoint, CrashRecoveryHarness};
//!
//! let mut harness = CrashRecoveryHarness::new();
//! let result = harness.producer_crash(CrashPoint::BeforeCommit);
//! assert!(result.passed, "{result:?}");
//! ```

use crate::fixtures::MemoryRig;
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tailsync_engine::{
    Consumer, ConsumerConfig, Credentials, Operation, Producer, ProducerConfig, RemoteEndpoint,
    SyncError, SyncResult,
};
use tailsync_storage::{OffsetStore, StorageError, StorageResult};

/// Points at which a cycle can be interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// The transfer call fails before any byte moves.
    BeforeTransfer,
    /// The connection drops after `after_bytes` bytes of the delta moved.
    DuringTransfer {
        /// Bytes that reach the other side before the drop.
        after_bytes: usize,
    },
    /// The bytes moved but the watermark write fails.
    BeforeCommit,
    /// The process dies right after a successful commit.
    AfterCommit,
}

impl CrashPoint {
    /// Bytes of a `delta`-byte transfer that end up duplicated after a
    /// restart at this point.
    pub fn duplicated_bytes(self, delta: usize) -> usize {
        match self {
            Self::BeforeTransfer | Self::AfterCommit => 0,
            Self::DuringTransfer { after_bytes } => after_bytes.min(delta),
            Self::BeforeCommit => delta,
        }
    }

    fn hits_endpoint(self) -> bool {
        matches!(self, Self::BeforeTransfer | Self::DuringTransfer { .. })
    }
}

/// A one-shot trigger shared between a test and the wrappers it armed.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct CrashSwitch {
    armed: Arc<AtomicBool>,
    fired: Arc<AtomicBool>,
}

impl CrashSwitch {
    /// Creates a disarmed switch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the switch; the next guarded call fails.
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Disarms the switch without firing.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Returns whether the switch has fired.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    fn trip(&self) -> bool {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.fired.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

/// A remote endpoint wrapper that fails transfers on demand.
///
/// Only [`CrashPoint::BeforeTransfer`] and [`CrashPoint::DuringTransfer`]
/// affect it; other points pass every call through.
pub struct CrashableEndpoint<E> {
    inner: E,
    point: CrashPoint,
    switch: CrashSwitch,
}

impl<E: RemoteEndpoint> CrashableEndpoint<E> {
    /// Wraps `inner`; it fails at `point` once `switch` is armed.
    pub fn new(inner: E, point: CrashPoint, switch: CrashSwitch) -> Self {
        Self {
            inner,
            point,
            switch,
        }
    }

    /// Returns the wrapped endpoint.
    pub fn into_inner(self) -> E {
        self.inner
    }

    fn should_crash(&self) -> bool {
        self.point.hits_endpoint() && self.switch.trip()
    }

    fn crash_stream(
        point: CrashPoint,
        mut stream: Box<dyn Read + '_>,
    ) -> SyncResult<Box<dyn Read + 'static>> {
        let mut content = Vec::new();
        stream
            .read_to_end(&mut content)
            .map_err(|e| SyncError::transport(Operation::Retrieve, e))?;
        let after_bytes = match point {
            CrashPoint::DuringTransfer { after_bytes } => after_bytes.min(content.len()),
            _ => 0,
        };
        content.truncate(after_bytes);
        Ok(Box::new(Cursor::new(content).chain(Severed)))
    }
}

impl<E: RemoteEndpoint> RemoteEndpoint for CrashableEndpoint<E> {
    fn authenticate(&mut self, credentials: &Credentials) -> SyncResult<()> {
        self.inner.authenticate(credentials)
    }

    fn size(&mut self, path: &str) -> SyncResult<Option<u64>> {
        self.inner.size(path)
    }

    fn append(&mut self, path: &str, data: &mut dyn Read) -> SyncResult<u64> {
        if !self.should_crash() {
            return self.inner.append(path, data);
        }
        if let CrashPoint::DuringTransfer { after_bytes } = self.point {
            let mut partial = Vec::new();
            data.take(after_bytes as u64)
                .read_to_end(&mut partial)
                .map_err(|e| SyncError::transport(Operation::Append, e))?;
            self.inner.append(path, &mut partial.as_slice())?;
        }
        Err(SyncError::connectivity(Operation::Append, "simulated crash"))
    }

    fn retrieve<'a>(&'a mut self, path: &str) -> SyncResult<Box<dyn Read + 'a>> {
        if !self.should_crash() {
            return self.inner.retrieve(path);
        }
        if self.point == CrashPoint::BeforeTransfer {
            return Err(SyncError::connectivity(Operation::Retrieve, "simulated crash"));
        }
        let point = self.point;
        Self::crash_stream(point, self.inner.retrieve(path)?)
    }

    fn retrieve_from<'a>(&'a mut self, path: &str, start: u64) -> SyncResult<Box<dyn Read + 'a>> {
        if !self.should_crash() {
            return self.inner.retrieve_from(path, start);
        }
        if self.point == CrashPoint::BeforeTransfer {
            return Err(SyncError::connectivity(Operation::Retrieve, "simulated crash"));
        }
        let point = self.point;
        Self::crash_stream(point, self.inner.retrieve_from(path, start)?)
    }

    fn close(&mut self) -> SyncResult<()> {
        self.inner.close()
    }
}

/// A reader whose connection is always gone.
struct Severed;

impl Read for Severed {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "simulated crash during transfer",
        ))
    }
}

/// A watermark store wrapper that fails a write on demand.
///
/// Only [`CrashPoint::BeforeCommit`] affects it.
pub struct CrashableOffsetStore<O> {
    inner: O,
    point: CrashPoint,
    switch: CrashSwitch,
}

impl<O: OffsetStore> CrashableOffsetStore<O> {
    /// Wraps `inner`; it fails at `point` once `switch` is armed.
    pub fn new(inner: O, point: CrashPoint, switch: CrashSwitch) -> Self {
        Self {
            inner,
            point,
            switch,
        }
    }
}

impl<O: OffsetStore> OffsetStore for CrashableOffsetStore<O> {
    fn read(&self) -> StorageResult<u64> {
        self.inner.read()
    }

    fn write(&mut self, offset: u64) -> StorageResult<()> {
        if self.point == CrashPoint::BeforeCommit && self.switch.trip() {
            return Err(StorageError::Io(io::Error::other(
                "simulated crash during watermark write",
            )));
        }
        self.inner.write(offset)
    }
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Expected length of the synced file after recovery.
    pub expected_len: usize,
    /// Actual length after recovery.
    pub actual_len: usize,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str, len: usize) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            expected_len: len,
            actual_len: len,
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, expected: usize, actual: usize, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            expected_len: expected,
            actual_len: actual,
            error: Some(error.to_string()),
        }
    }
}

const FIRST: &[u8] = b"hello";
const SECOND: &[u8] = b" world!\n";

/// Builds the content a restarted loop must converge to: the source with
/// the first `duplicated` bytes of the interrupted delta repeated.
fn expected_after_restart(prefix: &[u8], delta: &[u8], duplicated: usize) -> Vec<u8> {
    let mut expected = prefix.to_vec();
    expected.extend_from_slice(&delta[..duplicated]);
    expected.extend_from_slice(delta);
    expected
}

/// Runs crash-then-restart scenarios for both loops.
#[derive(Debug, Default)]
pub struct CrashRecoveryHarness {
    /// Results of crash recovery tests.
    pub results: Vec<CrashRecoveryResult>,
}

impl CrashRecoveryHarness {
    /// Creates a new harness.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ships one delta, crashes the producer at `point` while shipping the
    /// next, restarts it, and checks the remote file.
    pub fn producer_crash(&mut self, point: CrashPoint) -> CrashRecoveryResult {
        let description = format!("producer restart after {point:?}");
        let expected = expected_after_restart(FIRST, SECOND, point.duplicated_bytes(SECOND.len()));

        let result = (|| -> SyncResult<Result<Vec<u8>, String>> {
            let rig = MemoryRig::new("/shared/file1.txt");
            let switch = CrashSwitch::new();

            let mut producer = Producer::new(
                ProducerConfig::new(rig.remote_path.as_str()),
                rig.source.clone(),
                CrashableEndpoint::new(rig.remote.connect()?, point, switch.clone()),
                CrashableOffsetStore::new(rig.producer_offsets.clone(), point, switch.clone()),
            )?;
            rig.write_source(FIRST);
            producer.run_cycle()?;

            rig.write_source(SECOND);
            switch.arm();
            let crashed = producer.run_cycle();
            if point == CrashPoint::AfterCommit {
                crashed?;
            } else if crashed.is_ok() {
                return Ok(Err("cycle succeeded despite injected crash".to_string()));
            }
            drop(producer);

            let mut restarted = rig.producer()?;
            restarted.run_cycle()?;
            restarted.run_cycle()?;

            let source_len = (FIRST.len() + SECOND.len()) as u64;
            if rig.producer_watermark() != source_len {
                return Ok(Err(format!(
                    "watermark {} after restart, expected {source_len}",
                    rig.producer_watermark()
                )));
            }
            Ok(Ok(rig.remote_content()))
        })();

        self.record(&description, &expected, result)
    }

    /// Mirrors one delta, crashes the consumer at `point` while fetching
    /// the next, restarts it, and checks the local mirror.
    ///
    /// With `truncate_on_resume` the restarted consumer cuts the partial
    /// tail away and the mirror must come out exact.
    pub fn consumer_crash(
        &mut self,
        point: CrashPoint,
        truncate_on_resume: bool,
    ) -> CrashRecoveryResult {
        let description =
            format!("consumer restart after {point:?} (truncate_on_resume: {truncate_on_resume})");
        let duplicated = if truncate_on_resume {
            0
        } else {
            point.duplicated_bytes(SECOND.len())
        };
        let expected = expected_after_restart(FIRST, SECOND, duplicated);

        let result = (|| -> SyncResult<Result<Vec<u8>, String>> {
            let rig = MemoryRig::new("/shared/file1.txt");
            let switch = CrashSwitch::new();
            let config = ConsumerConfig::new(rig.remote_path.as_str())
                .with_truncate_on_resume(truncate_on_resume);

            let mut consumer = Consumer::new(
                config.clone(),
                rig.mirror.clone(),
                CrashableEndpoint::new(rig.remote.connect()?, point, switch.clone()),
                CrashableOffsetStore::new(rig.consumer_offsets.clone(), point, switch.clone()),
            )?;
            rig.remote.put(&rig.remote_path, FIRST);
            consumer.run_cycle()?;

            rig.remote.append_external(&rig.remote_path, SECOND);
            switch.arm();
            let crashed = consumer.run_cycle();
            if point == CrashPoint::AfterCommit {
                crashed?;
            } else if crashed.is_ok() {
                return Ok(Err("cycle succeeded despite injected crash".to_string()));
            }
            drop(consumer);

            let mut restarted = rig.consumer_with(config)?;
            restarted.run_cycle()?;
            restarted.run_cycle()?;

            let remote_len = (FIRST.len() + SECOND.len()) as u64;
            if rig.consumer_watermark() != remote_len {
                return Ok(Err(format!(
                    "watermark {} after restart, expected {remote_len}",
                    rig.consumer_watermark()
                )));
            }
            Ok(Ok(rig.mirror.data()))
        })();

        self.record(&description, &expected, result)
    }

    fn record(
        &mut self,
        description: &str,
        expected: &[u8],
        outcome: SyncResult<Result<Vec<u8>, String>>,
    ) -> CrashRecoveryResult {
        let result = match outcome {
            Ok(Ok(actual)) if actual == expected => {
                CrashRecoveryResult::pass(description, expected.len())
            }
            Ok(Ok(actual)) => CrashRecoveryResult::fail(
                description,
                expected.len(),
                actual.len(),
                &format!(
                    "content mismatch: expected {:?}, got {:?}",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&actual)
                ),
            ),
            Ok(Err(message)) => {
                CrashRecoveryResult::fail(description, expected.len(), 0, &message)
            }
            Err(e) => CrashRecoveryResult::fail(description, expected.len(), 0, &e.to_string()),
        };
        self.results.push(result.clone());
        result
    }

    /// Runs every crash point against both loops.
    pub fn run_all_tests(&mut self) -> Vec<CrashRecoveryResult> {
        let points = [
            CrashPoint::BeforeTransfer,
            CrashPoint::DuringTransfer { after_bytes: 3 },
            CrashPoint::BeforeCommit,
            CrashPoint::AfterCommit,
        ];
        let mut results = Vec::new();
        for point in points {
            results.push(self.producer_crash(point));
            results.push(self.consumer_crash(point, false));
            results.push(self.consumer_crash(point, true));
        }
        results
    }

    /// Returns a summary of all test results.
    pub fn summary(&self) -> String {
        let passed = self.results.iter().filter(|r| r.passed).count();
        let mut summary = format!(
            "Crash Recovery Tests: {}/{} passed\n",
            passed,
            self.results.len()
        );
        for result in &self.results {
            let status = if result.passed { "PASS" } else { "FAIL" };
            summary.push_str(&format!("  [{status}] {}\n", result.description));
            if let Some(error) = &result.error {
                summary.push_str(&format!("         {error}\n"));
            }
        }
        summary
    }

    /// Returns whether all tests passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }
}
