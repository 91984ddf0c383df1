//! # Byte Sources
//!
//! Random-access byte ranges over a fixed-length resource. The demuxer only
//! ever asks for `(offset, length)` ranges, so anything that can answer that
//! (a local file, an in-memory copy, a cached network range) can back it.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Invalid range: offset {offset} is outside resource of length {len}")]
    InvalidRange { offset: u64, len: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ranged reader over a resource whose length does not change.
pub trait ByteSource: Send + Sync {
    /// Total length of the resource in bytes.
    fn len(&self) -> u64;

    /// Read `length` bytes starting at `offset`.
    ///
    /// Fails with [`SourceError::InvalidRange`] when `offset >= len()`. When the
    /// range runs past the end, the returned buffer is clamped to the tail.
    fn read(&self, offset: u64, length: usize) -> Result<Bytes, SourceError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolve a requested range against the resource length, returning the
/// clamped byte count.
fn clamp_range(offset: u64, length: usize, total: u64) -> Result<usize, SourceError> {
    if offset >= total {
        return Err(SourceError::InvalidRange { offset, len: total });
    }
    let available = total - offset;
    Ok((length as u64).min(available) as usize)
}

// ============================================================================
// Memory Source
// ============================================================================

/// Source backed by a shared in-memory buffer. Reads are zero-copy slices.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl ByteSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&self, offset: u64, length: usize) -> Result<Bytes, SourceError> {
        let count = clamp_range(offset, length, self.len())?;
        let start = offset as usize;
        Ok(self.data.slice(start..start + count))
    }
}

// ============================================================================
// File Source
// ============================================================================

/// Source backed by a local file. The handle is shared behind a mutex so
/// seek + read pairs stay atomic when the source is used from several threads.
#[derive(Debug)]
pub struct FileSource {
    file: Mutex<File>,
    len: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        tracing::debug!("Opened {:?} ({} bytes)", path.as_ref(), len);
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read(&self, offset: u64, length: usize) -> Result<Bytes, SourceError> {
        let count = clamp_range(offset, length, self.len)?;
        let mut buf = vec![0u8; count];

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;

        Ok(Bytes::from(buf))
    }
}
