//! `offset`: inspect or override a watermark record.

use serde::Serialize;
use std::path::Path;
use tailsync_storage::{FileOffsetStore, OffsetStore};
use tracing::info;

#[derive(Serialize)]
struct OffsetReport<'a> {
    path: &'a Path,
    exists: bool,
    offset: u64,
}

/// Prints the watermark stored at `path`. An absent record reads as 0.
pub fn show(path: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let offset = FileOffsetStore::peek(path)?;
    let report = OffsetReport {
        path,
        exists: path.exists(),
        offset,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.offset);
    }
    Ok(())
}

/// Overwrites the watermark at `path`.
///
/// Takes the record's lock, so it fails while a loop owns the record.
pub fn set(path: &Path, value: u64) -> Result<(), Box<dyn std::error::Error>> {
    let mut store = FileOffsetStore::open(path)?;
    let previous = store.read().unwrap_or(0);
    store.write(value)?;
    info!(path = %path.display(), previous, offset = value, "watermark overwritten");
    Ok(())
}
