//! Test fixtures.
//!
//! Ready-made wiring for a producer, a remote store and a consumer, either
//! entirely in memory or over a loopback server with files on disk.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tailsync_engine::{
    Consumer, ConsumerConfig, MemoryEndpoint, MemoryRemote, Producer, ProducerConfig,
    RemoteConfig, SyncResult,
};
use tailsync_server::{BackgroundServer, ServerConfig};
use tailsync_storage::{InMemoryBackend, MemoryOffsetStore, OffsetStore, StorageBackend};
use tempfile::TempDir;

/// A producer built from in-memory parts.
pub type MemoryProducer = Producer<InMemoryBackend, MemoryEndpoint, MemoryOffsetStore>;

/// A consumer built from in-memory parts.
pub type MemoryConsumer = Consumer<InMemoryBackend, MemoryEndpoint, MemoryOffsetStore>;

/// One remote file with a producer side and a consumer side, all in memory.
///
/// Every handle is shared, so loops built from the rig can be dropped and
/// rebuilt to simulate a process restart.
#[derive(Debug, Clone)]
pub struct MemoryRig {
    /// The remote store.
    pub remote: MemoryRemote,
    /// The file the producer ships.
    pub source: InMemoryBackend,
    /// The producer's watermark record.
    pub producer_offsets: MemoryOffsetStore,
    /// The consumer's local mirror.
    pub mirror: InMemoryBackend,
    /// The consumer's watermark record.
    pub consumer_offsets: MemoryOffsetStore,
    /// Path of the shared file on the remote store.
    pub remote_path: String,
}

impl MemoryRig {
    /// Creates an empty rig.
    pub fn new(remote_path: &str) -> Self {
        Self {
            remote: MemoryRemote::new(),
            source: InMemoryBackend::new(),
            producer_offsets: MemoryOffsetStore::new(),
            mirror: InMemoryBackend::new(),
            consumer_offsets: MemoryOffsetStore::new(),
            remote_path: remote_path.to_string(),
        }
    }

    /// Plays the external writer: appends to the source.
    pub fn write_source(&self, data: &[u8]) {
        let mut writer = self.source.clone();
        writer.append(data).expect("in-memory append cannot fail");
    }

    /// Builds a producer with default settings.
    pub fn producer(&self) -> SyncResult<MemoryProducer> {
        self.producer_with(ProducerConfig::new(self.remote_path.as_str()))
    }

    /// Builds a producer with `config`.
    pub fn producer_with(&self, config: ProducerConfig) -> SyncResult<MemoryProducer> {
        Producer::new(
            config,
            self.source.clone(),
            self.remote.connect()?,
            self.producer_offsets.clone(),
        )
    }

    /// Builds a consumer with default settings.
    pub fn consumer(&self) -> SyncResult<MemoryConsumer> {
        self.consumer_with(ConsumerConfig::new(self.remote_path.as_str()))
    }

    /// Builds a consumer with `config`.
    pub fn consumer_with(&self, config: ConsumerConfig) -> SyncResult<MemoryConsumer> {
        Consumer::new(
            config,
            self.mirror.clone(),
            self.remote.connect()?,
            self.consumer_offsets.clone(),
        )
    }

    /// Returns the remote file, or nothing if it was never created.
    pub fn remote_content(&self) -> Vec<u8> {
        self.remote.file(&self.remote_path).unwrap_or_default()
    }

    /// Returns the persisted producer watermark.
    pub fn producer_watermark(&self) -> u64 {
        self.producer_offsets.read().expect("producer record is valid")
    }

    /// Returns the persisted consumer watermark.
    pub fn consumer_watermark(&self) -> u64 {
        self.consumer_offsets.read().expect("consumer record is valid")
    }
}

/// Runs a test against a fresh in-memory rig.
///
/// # Example
///
/// ```rust
/// use tailsync_testkit::with_memory_rig;
///
/// with_memory_rig(|rig| {
///     rig.write_source(b"abc");
///     rig.producer().unwrap().run_cycle().unwrap();
///     assert_eq!(rig.producer_watermark(), 3);
/// });
/// ```
pub fn with_memory_rig<F, R>(f: F) -> R
where
    F: FnOnce(&MemoryRig) -> R,
{
    let rig = MemoryRig::new("/shared/file1.txt");
    f(&rig)
}

/// A remote store server on a loopback port, rooted in a temp directory.
pub struct TestServer {
    server: BackgroundServer,
    root: TempDir,
}

impl TestServer {
    /// Starts a server that accepts anonymous sessions.
    pub fn start() -> Self {
        Self::start_with(|config| config)
    }

    /// Starts a server after letting `configure` adjust its config.
    pub fn start_with(configure: impl FnOnce(ServerConfig) -> ServerConfig) -> Self {
        let root = TempDir::new().expect("Failed to create temp directory");
        let config = configure(ServerConfig::new(
            "127.0.0.1:0".parse().expect("valid loopback address"),
            root.path(),
        ));
        let server = BackgroundServer::start(config).expect("Failed to start server");
        Self { server, root }
    }

    /// Returns a client config pointing at this server with short timeouts.
    pub fn remote_config(&self) -> RemoteConfig {
        RemoteConfig::new(self.server.addr().to_string())
            .with_connect_timeout(Duration::from_secs(2))
            .with_io_timeout(Some(Duration::from_secs(5)))
    }

    /// Returns the directory the server stores files under.
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Reads a stored file, or nothing if it does not exist.
    pub fn file(&self, remote_path: &str) -> Vec<u8> {
        std::fs::read(self.root.path().join(remote_path.trim_start_matches('/')))
            .unwrap_or_default()
    }

    /// Returns the running server.
    pub fn server(&self) -> &BackgroundServer {
        &self.server
    }
}

/// A scratch directory for local files and watermark records.
pub struct TempPaths {
    dir: TempDir,
}

impl TempPaths {
    /// Creates a new scratch directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Returns `name` inside the directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

impl Default for TempPaths {
    fn default() -> Self {
        Self::new()
    }
}
