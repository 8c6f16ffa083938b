//! Reference scenarios over a real server, with files and records on disk.

use std::time::Duration;
use tailsync_engine::{
    Consumer, ConsumerConfig, Credentials, Producer, ProducerConfig, RetryConfig, Scheduler,
    Supervisor, SyncError, TcpEndpoint,
};
use tailsync_storage::{FileBackend, FileOffsetStore, StorageBackend};
use tailsync_testkit::{TempPaths, TestServer};

const REMOTE_PATH: &str = "/shared/file1.txt";

#[test]
fn first_upload_creates_remote_and_record() {
    let server = TestServer::start();
    let paths = TempPaths::new();
    let source_path = paths.path("file1.txt");
    let mut writer = FileBackend::open_with_create_dirs(&source_path).unwrap();

    let mut producer = Producer::new(
        ProducerConfig::new(REMOTE_PATH),
        FileBackend::open_existing(&source_path).unwrap(),
        TcpEndpoint::connect(&server.remote_config()).unwrap(),
        FileOffsetStore::open(&paths.path("offset.txt")).unwrap(),
    )
    .unwrap();

    writer.append(b"hello").unwrap();
    producer.run_cycle().unwrap();

    assert_eq!(server.file(REMOTE_PATH), b"hello");
    assert_eq!(std::fs::read_to_string(paths.path("offset.txt")).unwrap(), "5");
}

#[test]
fn resumed_upload_ships_only_the_tail() {
    let server = TestServer::start();
    std::fs::create_dir_all(server.root().join("shared")).unwrap();
    std::fs::write(server.root().join("shared/file1.txt"), b"hello").unwrap();

    let paths = TempPaths::new();
    std::fs::write(paths.path("file1.txt"), b"helloworld").unwrap();
    std::fs::write(paths.path("offset.txt"), b"5").unwrap();

    let mut producer = Producer::new(
        ProducerConfig::new(REMOTE_PATH),
        FileBackend::open_existing(&paths.path("file1.txt")).unwrap(),
        TcpEndpoint::connect(&server.remote_config()).unwrap(),
        FileOffsetStore::open(&paths.path("offset.txt")).unwrap(),
    )
    .unwrap();

    assert_eq!(producer.run_cycle().unwrap().bytes(), 5);
    assert_eq!(server.file(REMOTE_PATH), b"helloworld");
    assert_eq!(std::fs::read_to_string(paths.path("offset.txt")).unwrap(), "10");
}

#[test]
fn consumer_skips_when_caught_up_then_fetches() {
    let server = TestServer::start();
    std::fs::create_dir_all(server.root().join("shared")).unwrap();
    std::fs::write(server.root().join("shared/file1.txt"), b"hello").unwrap();

    let paths = TempPaths::new();
    std::fs::write(paths.path("mirror.txt"), b"hello").unwrap();
    std::fs::write(paths.path("offset.txt"), b"5").unwrap();

    let mut consumer = Consumer::new(
        ConsumerConfig::new(REMOTE_PATH),
        FileBackend::open(&paths.path("mirror.txt")).unwrap(),
        TcpEndpoint::connect(&server.remote_config()).unwrap(),
        FileOffsetStore::open(&paths.path("offset.txt")).unwrap(),
    )
    .unwrap();

    assert!(!consumer.run_cycle().unwrap().transferred());
    assert_eq!(std::fs::read_to_string(paths.path("offset.txt")).unwrap(), "5");

    std::fs::write(server.root().join("shared/file1.txt"), b"hello world!").unwrap();
    assert_eq!(consumer.run_cycle().unwrap().bytes(), 7);
    assert_eq!(std::fs::read(paths.path("mirror.txt")).unwrap(), b"hello world!");
    assert_eq!(std::fs::read_to_string(paths.path("offset.txt")).unwrap(), "12");
}

#[test]
fn consumer_mirrors_from_scratch() {
    let server = TestServer::start();
    std::fs::create_dir_all(server.root().join("shared")).unwrap();
    std::fs::write(server.root().join("shared/file1.txt"), b"hello world!").unwrap();

    let paths = TempPaths::new();
    let mut consumer = Consumer::new(
        ConsumerConfig::new(REMOTE_PATH),
        FileBackend::open_with_create_dirs(&paths.path("local/mirror.txt")).unwrap(),
        TcpEndpoint::connect(&server.remote_config()).unwrap(),
        FileOffsetStore::open(&paths.path("local/offset.txt")).unwrap(),
    )
    .unwrap();

    assert_eq!(consumer.run_cycle().unwrap().bytes(), 12);
    assert_eq!(
        std::fs::read(paths.path("local/mirror.txt")).unwrap(),
        b"hello world!"
    );
    assert_eq!(
        std::fs::read_to_string(paths.path("local/offset.txt")).unwrap(),
        "12"
    );
}

#[test]
fn corrupt_record_stops_before_transfer() {
    let server = TestServer::start();
    let paths = TempPaths::new();
    std::fs::write(paths.path("file1.txt"), b"hello").unwrap();
    std::fs::write(paths.path("offset.txt"), b"abc").unwrap();

    let err = Producer::new(
        ProducerConfig::new(REMOTE_PATH),
        FileBackend::open_existing(&paths.path("file1.txt")).unwrap(),
        TcpEndpoint::connect(&server.remote_config()).unwrap(),
        FileOffsetStore::open(&paths.path("offset.txt")).unwrap(),
    )
    .unwrap_err();

    assert!(matches!(err, SyncError::CorruptRecord { .. }));
    assert!(!err.is_retryable());
    assert!(server.file(REMOTE_PATH).is_empty());
    assert_eq!(std::fs::read(paths.path("offset.txt")).unwrap(), b"abc");
}

#[test]
fn authenticated_mirror_through_supervisor() {
    let server = TestServer::start_with(|config| config.with_user("ftpuser", "ftppass"));
    let paths = TempPaths::new();
    std::fs::write(paths.path("app.log"), b"one\ntwo\n").unwrap();
    let remote = server
        .remote_config()
        .with_credentials(Credentials::new("ftpuser", "ftppass"));

    let supervisor = Supervisor::new(
        Scheduler::new(Duration::from_millis(5)).with_max_cycles(2),
        RetryConfig::no_retry(),
    );
    let summary = supervisor
        .run(|| {
            Producer::new(
                ProducerConfig::new("logs/app.log"),
                FileBackend::open_existing(&paths.path("app.log")).unwrap(),
                TcpEndpoint::connect(&remote)?,
                FileOffsetStore::open(&paths.path("app.offset")).unwrap(),
            )
        })
        .unwrap();

    assert_eq!(summary.cycles, 2);
    assert_eq!(summary.bytes, 8);
    assert_eq!(server.file("logs/app.log"), b"one\ntwo\n");
}

#[test]
fn consumer_outlives_server_idle_timeout() {
    let server =
        TestServer::start_with(|config| config.with_idle_timeout(Duration::from_millis(100)));
    std::fs::create_dir_all(server.root().join("shared")).unwrap();
    std::fs::write(server.root().join("shared/file1.txt"), b"hello world!").unwrap();
    let paths = TempPaths::new();
    let remote = server.remote_config();

    let supervisor = Supervisor::new(
        Scheduler::new(Duration::from_millis(300)).with_max_cycles(2),
        RetryConfig::no_retry(),
    );
    let summary = supervisor
        .run(|| {
            Consumer::new(
                ConsumerConfig::new(REMOTE_PATH),
                FileBackend::open(&paths.path("mirror.txt")).unwrap(),
                TcpEndpoint::connect(&remote)?,
                FileOffsetStore::open(&paths.path("offset.txt")).unwrap(),
            )
        })
        .unwrap();

    assert_eq!(summary.cycles, 2);
    assert_eq!(std::fs::read(paths.path("mirror.txt")).unwrap(), b"hello world!");
}

#[test]
fn producer_ships_after_session_went_idle() {
    let server =
        TestServer::start_with(|config| config.with_idle_timeout(Duration::from_millis(100)));
    let paths = TempPaths::new();
    let source_path = paths.path("file1.txt");
    std::fs::write(&source_path, b"hello").unwrap();

    let mut producer = Producer::new(
        ProducerConfig::new(REMOTE_PATH),
        FileBackend::open_existing(&source_path).unwrap(),
        TcpEndpoint::connect(&server.remote_config()).unwrap(),
        FileOffsetStore::open(&paths.path("offset.txt")).unwrap(),
    )
    .unwrap();
    producer.run_cycle().unwrap();

    std::thread::sleep(Duration::from_millis(400));
    FileBackend::open_existing(&source_path)
        .unwrap()
        .append(b"world")
        .unwrap();

    assert_eq!(producer.run_cycle().unwrap().bytes(), 5);
    assert_eq!(server.file(REMOTE_PATH), b"helloworld");
}
