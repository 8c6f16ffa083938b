//! `pull`: mirror a remote file into a local one.

use super::{finish, stop_on_interrupt, supervisor};
use crate::config::{LoopSettings, PullSettings};
use tailsync_engine::{Consumer, Operation, RemoteConfig, SyncError, SyncResult, TcpEndpoint};
use tailsync_storage::{FileBackend, FileOffsetStore, OffsetStore};
use tracing::info;

type FileConsumer = Consumer<FileBackend, TcpEndpoint, FileOffsetStore>;

/// Runs the consumer until stopped, the cycle limit is hit, or a fatal error.
pub fn run(
    settings: PullSettings,
    loop_settings: LoopSettings,
    remote: RemoteConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        local = %settings.paths.local.display(),
        remote_path = %settings.consumer.remote_path,
        address = %remote.address,
        "starting consumer"
    );
    let stop = stop_on_interrupt()?;
    let result = supervisor(&loop_settings, stop).run(|| build(&settings, &remote));
    finish("consumer", result)?;
    Ok(())
}

fn build(settings: &PullSettings, remote: &RemoteConfig) -> SyncResult<FileConsumer> {
    let offsets = FileOffsetStore::open(&settings.paths.watermark)
        .map_err(|e| SyncError::local(Operation::ReadWatermark, e))?;
    offsets
        .read()
        .map_err(|e| SyncError::local(Operation::ReadWatermark, e))?;

    let destination = FileBackend::open_with_create_dirs(&settings.paths.local)
        .map_err(|e| SyncError::local(Operation::LocalAppend, e))?;
    let endpoint = TcpEndpoint::connect(remote)?;
    Consumer::new(settings.consumer.clone(), destination, endpoint, offsets)
}
