//! Archive container seam.
//!
//! The engine only needs a record-oriented view of a container: enumerate
//! named entries, read and write their bytes, and save. Two shapes are
//! provided: [`DirectoryArchive`] over an unpacked directory tree and
//! [`MemoryArchive`], a flat indexed bundle held in memory.
//!
//! Saving invalidates every [`Record`] handed out before the save. Handles
//! carry the generation they were issued in, and reads or writes through a
//! stale handle fail with [`ArchiveError::StaleRecord`].

pub mod dir;
pub mod memory;

pub use dir::DirectoryArchive;
pub use memory::MemoryArchive;

use crate::vpath;
use std::path::PathBuf;
use thiserror::Error;

/// Handle to one named entry, valid until the next save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    path: String,
    size: u64,
    generation: u64,
}

impl Record {
    pub(crate) fn new(path: impl Into<String>, size: u64, generation: u64) -> Self {
        Self {
            path: path.into(),
            size,
            generation,
        }
    }

    /// Forward-slash virtual path as stored in the container.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Size in bytes when the handle was issued.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("archive not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid archive format at {path}: {reason}")]
    InvalidFormat { path: PathBuf, reason: String },

    #[error("no entry named '{0}' in archive")]
    MissingRecord(String),

    #[error("stale record handle for '{path}': the archive was saved after it was obtained")]
    StaleRecord { path: String },

    #[error("entry '{0}' is read-only")]
    ReadOnly(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A container of named, byte-addressable entries.
///
/// Implementations are not required to tolerate concurrent access; callers
/// that parallelize serialize every call through one lock.
pub trait Archive: Send {
    /// Snapshot of all entries, valid until the next [`save`](Archive::save).
    fn records(&self) -> Vec<Record>;

    /// Look up an entry by path (case-insensitive, separator-normalized).
    fn find(&self, path: &str) -> Option<Record> {
        let wanted = vpath::key(path);
        self.records()
            .into_iter()
            .find(|record| vpath::key(record.path()) == wanted)
    }

    fn read(&self, record: &Record) -> Result<Vec<u8>, ArchiveError>;

    fn write(&mut self, record: &Record, data: &[u8]) -> Result<(), ArchiveError>;

    /// Persist all writes. Invalidates previously issued records.
    fn save(&mut self) -> Result<(), ArchiveError>;
}

impl<A: Archive + ?Sized> Archive for &mut A {
    fn records(&self) -> Vec<Record> {
        (**self).records()
    }

    fn find(&self, path: &str) -> Option<Record> {
        (**self).find(path)
    }

    fn read(&self, record: &Record) -> Result<Vec<u8>, ArchiveError> {
        (**self).read(record)
    }

    fn write(&mut self, record: &Record, data: &[u8]) -> Result<(), ArchiveError> {
        (**self).write(record, data)
    }

    fn save(&mut self) -> Result<(), ArchiveError> {
        (**self).save()
    }
}

pub(crate) fn check_generation(record: &Record, current: u64) -> Result<(), ArchiveError> {
    if record.generation() != current {
        return Err(ArchiveError::StaleRecord {
            path: record.path().to_string(),
        });
    }
    Ok(())
}
