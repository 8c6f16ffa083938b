//! Watermark arithmetic.
//!
//! Everything a cycle decides about which bytes to move lives here, so the
//! loops only sequence I/O.

use crate::error::{SyncError, SyncResult};
use std::io::{self, Read};

/// The half-open byte range `[start, end)` a producer cycle ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delta {
    /// First byte, equal to the watermark.
    pub start: u64,
    /// One past the last byte, equal to the measured size.
    pub end: u64,
}

impl Delta {
    /// Computes the delta from the watermark to a freshly measured size.
    ///
    /// A size below the watermark means the file was truncated or
    /// replaced, which the sync model cannot follow.
    pub fn between(watermark: u64, size: u64) -> SyncResult<Self> {
        if size < watermark {
            return Err(SyncError::WatermarkAhead { watermark, size });
        }
        Ok(Self {
            start: watermark,
            end: size,
        })
    }

    /// Length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Returns true if there is nothing to ship.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Splits the range into `(offset, len)` reads of at most `chunk` bytes.
    pub fn chunks(&self, chunk: usize) -> impl Iterator<Item = (u64, usize)> {
        let chunk = chunk.max(1) as u64;
        let end = self.end;
        let mut offset = self.start;
        std::iter::from_fn(move || {
            if offset >= end {
                return None;
            }
            let len = chunk.min(end - offset);
            let item = (offset, len as usize);
            offset += len;
            Some(item)
        })
    }
}

/// Returns true if the remote file holds bytes past the watermark.
pub fn needs_fetch(remote_size: u64, watermark: u64) -> bool {
    remote_size > watermark
}

/// Advances a watermark by the number of bytes just made durable.
pub fn advance(watermark: u64, received: u64) -> SyncResult<u64> {
    watermark.checked_add(received).ok_or_else(|| {
        SyncError::Protocol(format!(
            "watermark {watermark} + {received} bytes overflows a 64-bit offset"
        ))
    })
}

/// Reads and discards up to `n` bytes.
///
/// Returns how many were actually skipped; a stream shorter than `n` is not
/// an error.
pub fn skip_prefix<R: Read + ?Sized>(reader: &mut R, n: u64) -> io::Result<u64> {
    let mut limited = (&mut *reader).take(n);
    io::copy(&mut limited, &mut io::sink())
}
