//! `push`: ship a growing local file to the remote store.

use super::{finish, stop_on_interrupt, supervisor};
use crate::config::{LoopSettings, PushSettings};
use tailsync_engine::{
    HeartbeatWriter, Operation, Producer, RemoteConfig, SyncError, SyncResult, TcpEndpoint,
};
use tailsync_storage::{FileBackend, FileOffsetStore, OffsetStore};
use tracing::info;

type FileProducer = Producer<FileBackend, TcpEndpoint, FileOffsetStore>;

/// Runs the producer until stopped, the cycle limit is hit, or a fatal error.
pub fn run(
    settings: PushSettings,
    loop_settings: LoopSettings,
    remote: RemoteConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        local = %settings.paths.local.display(),
        remote_path = %settings.producer.remote_path,
        address = %remote.address,
        "starting producer"
    );
    let stop = stop_on_interrupt()?;
    let result = supervisor(&loop_settings, stop).run(|| build(&settings, &remote));
    finish("producer", result)?;
    Ok(())
}

fn build(settings: &PushSettings, remote: &RemoteConfig) -> SyncResult<FileProducer> {
    // Watermark problems surface before any network traffic.
    let offsets = FileOffsetStore::open(&settings.paths.watermark)
        .map_err(|e| SyncError::local(Operation::ReadWatermark, e))?;
    offsets
        .read()
        .map_err(|e| SyncError::local(Operation::ReadWatermark, e))?;

    let local = &settings.paths.local;
    let heartbeat = if settings.heartbeat {
        let target = FileBackend::open_with_create_dirs(local)
            .map_err(|e| SyncError::local(Operation::Heartbeat, e))?;
        Some(HeartbeatWriter::new(target))
    } else {
        None
    };
    let source =
        FileBackend::open_existing(local).map_err(|e| SyncError::local(Operation::Measure, e))?;

    let endpoint = TcpEndpoint::connect(remote)?;
    let producer = Producer::new(settings.producer.clone(), source, endpoint, offsets)?;
    Ok(match heartbeat {
        Some(writer) => producer.with_heartbeat(writer),
        None => producer,
    })
}
