//! Filesystem capability and cache error types
//!
//! The cache never touches `std::fs` directly; it goes through the
//! [`FileSystem`] trait so the same store logic runs against a real disk or
//! against [`MemoryFs`](crate::cache::MemoryFs) in tests.

use crate::cache::record::RecordError;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Path conflict: {} (or an ancestor) is occupied", .0.display())]
    PathConflict(PathBuf),

    #[error("Cache record already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("Cache record not found: {0}")]
    NotFound(String),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// What kind of entry lives at a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// Reader handed out by [`FileSystem::open`]
pub type BoxRead = Box<dyn Read + Send>;

/// Writer handed out by [`FileSystem::create_new`]
pub type BoxWrite = Box<dyn Write + Send>;

/// Minimal filesystem surface used by the cache store
///
/// Implementations must be safe to share between the crawler workers and the
/// HTTP serving tasks.
pub trait FileSystem: Send + Sync {
    /// Creates a directory and all missing parents
    fn mkdir_all(&self, path: &Path) -> io::Result<()>;

    /// Creates a new file, failing with `AlreadyExists` if anything is there
    fn create_new(&self, path: &Path) -> io::Result<BoxWrite>;

    /// Opens an existing file for reading
    fn open(&self, path: &Path) -> io::Result<BoxRead>;

    /// Atomically replaces `to` with `from`
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Removes a file or a directory tree; missing paths are not an error
    fn remove_all(&self, path: &Path) -> io::Result<()>;

    /// Returns the kind of entry at `path`, `NotFound` if there is none
    fn metadata(&self, path: &Path) -> io::Result<EntryKind>;

    /// Returns the working directory used to anchor relative cache roots
    fn current_dir(&self) -> io::Result<PathBuf>;
}
