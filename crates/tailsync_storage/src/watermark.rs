//! Durable watermark records.
//!
//! A watermark is the number of bytes of a file one side has already moved.
//! On disk it is a plain-text file holding the decimal value and nothing
//! else:
//!
//! ```text
//! <record>        # e.g. "1048576"
//! <record>.lock   # advisory lock held by the owning process
//! <record>.tmp    # only exists mid-write
//! ```
//!
//! A missing record reads as 0. A record that exists but does not parse is
//! [`StorageError::CorruptRecord`], never silently reset.

use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Persistence for a single byte-offset watermark.
pub trait OffsetStore: Send {
    /// Reads the persisted watermark, or 0 if none has been written yet.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CorruptRecord`] if the record is present but
    /// unparseable, or an I/O error if it cannot be read.
    fn read(&self) -> StorageResult<u64>;

    /// Atomically replaces the persisted watermark.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be durably written.
    fn write(&mut self, offset: u64) -> StorageResult<()>;
}

impl<S: OffsetStore + ?Sized> OffsetStore for Box<S> {
    fn read(&self) -> StorageResult<u64> {
        (**self).read()
    }

    fn write(&mut self, offset: u64) -> StorageResult<()> {
        (**self).write(offset)
    }
}

/// Parses the content of a watermark record.
///
/// Surrounding whitespace is ignored, as is a single leading `+`; everything
/// else must be decimal digits that fit in a `u64`.
///
/// # Errors
///
/// Returns [`StorageError::CorruptRecord`] naming `path` on any other input.
pub fn parse_watermark(path: &Path, content: &[u8]) -> StorageResult<u64> {
    let corrupt = || StorageError::CorruptRecord {
        path: path.to_path_buf(),
        content: String::from_utf8_lossy(content).into_owned(),
    };

    let text = std::str::from_utf8(content).map_err(|_| corrupt())?;
    let trimmed = text.trim();
    let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(corrupt());
    }

    digits.parse::<u64>().map_err(|_| corrupt())
}

/// A watermark stored as a plain-text file.
///
/// Holding a `FileOffsetStore` means holding an exclusive advisory lock on
/// `<record>.lock`; each side owns its watermark alone.
#[derive(Debug)]
pub struct FileOffsetStore {
    path: PathBuf,
    _lock_file: File,
}

impl FileOffsetStore {
    /// Opens the record at `path`, taking its lock.
    ///
    /// The record itself is not created until the first [`write`](OffsetStore::write).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process owns the record,
    /// or an I/O error if the lock file cannot be created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_path = sibling(path, "lock");
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.to_path_buf()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Reads a record without taking its lock.
    ///
    /// For inspection only; a live loop may replace the value at any time.
    ///
    /// # Errors
    ///
    /// Same as [`OffsetStore::read`].
    pub fn peek(path: &Path) -> StorageResult<u64> {
        read_record(path)
    }

    /// Returns the path of the record.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn sync_parent(&self) -> StorageResult<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        File::open(parent)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_parent(&self) -> StorageResult<()> {
        // NTFS journals the rename
        Ok(())
    }
}

impl OffsetStore for FileOffsetStore {
    fn read(&self) -> StorageResult<u64> {
        read_record(&self.path)
    }

    fn write(&mut self, offset: u64) -> StorageResult<()> {
        let temp_path = sibling(&self.path, "tmp");

        let mut file = File::create(&temp_path)?;
        file.write_all(offset.to_string().as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &self.path)?;
        self.sync_parent()
    }
}

fn read_record(path: &Path) -> StorageResult<u64> {
    match fs::read(path) {
        Ok(content) => parse_watermark(path, &content),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// An in-memory watermark record.
///
/// Clones share the record, so a test can drop a loop, build a new one from
/// a clone, and observe exactly what a restarted process would read.
#[derive(Debug, Clone, Default)]
pub struct MemoryOffsetStore {
    content: Arc<RwLock<Option<Vec<u8>>>>,
}

impl MemoryOffsetStore {
    /// Creates a store with no record (reads as 0).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store whose record holds `content` verbatim.
    #[must_use]
    pub fn with_content(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: Arc::new(RwLock::new(Some(content.into()))),
        }
    }

    /// Returns the raw record, if one has been written.
    #[must_use]
    pub fn raw(&self) -> Option<Vec<u8>> {
        self.content.read().clone()
    }
}

impl OffsetStore for MemoryOffsetStore {
    fn read(&self) -> StorageResult<u64> {
        match self.content.read().as_deref() {
            Some(content) => parse_watermark(Path::new("<memory>"), content),
            None => Ok(0),
        }
    }

    fn write(&mut self, offset: u64) -> StorageResult<()> {
        *self.content.write() = Some(offset.to_string().into_bytes());
        Ok(())
    }
}
