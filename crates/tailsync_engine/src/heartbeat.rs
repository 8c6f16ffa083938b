//! Synthetic log writer.
//!
//! Stands in for the application whose log the producer ships: one
//! timestamped line per cycle, written before the cycle measures the file.

use chrono::{Local, SecondsFormat};
use tailsync_storage::{StorageBackend, StorageResult};

/// Appends `Log entry at <RFC 3339 timestamp>` lines to a file.
pub struct HeartbeatWriter {
    target: Box<dyn StorageBackend>,
}

impl HeartbeatWriter {
    /// Creates a writer appending to `target`.
    pub fn new(target: impl StorageBackend + 'static) -> Self {
        Self {
            target: Box::new(target),
        }
    }

    /// Appends one line and makes it durable. Returns the line length.
    pub fn write_entry(&mut self) -> StorageResult<u64> {
        let line = format_entry(&Local::now().to_rfc3339_opts(SecondsFormat::Secs, false));
        self.target.append(line.as_bytes())?;
        self.target.sync()?;
        Ok(line.len() as u64)
    }
}

impl std::fmt::Debug for HeartbeatWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatWriter").finish_non_exhaustive()
    }
}

fn format_entry(timestamp: &str) -> String {
    format!("Log entry at {timestamp}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tailsync_storage::InMemoryBackend;

    #[test]
    fn entry_format() {
        assert_eq!(
            format_entry("2024-05-01T10:00:00+02:00"),
            "Log entry at 2024-05-01T10:00:00+02:00\n"
        );
    }

    #[test]
    fn writes_one_line_per_call() {
        let backend = InMemoryBackend::new();
        let mut writer = HeartbeatWriter::new(backend.clone());

        let first = writer.write_entry().unwrap();
        let second = writer.write_entry().unwrap();

        let content = String::from_utf8(backend.data()).unwrap();
        assert_eq!(content.len() as u64, first + second);
        assert_eq!(content.lines().count(), 2);
        assert!(content.lines().all(|l| l.starts_with("Log entry at ")));
    }
}
