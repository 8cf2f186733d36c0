use crate::error::{CacheError, Result};
use fs2::FileExt as _;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// An advisory lock on a single cache entry, safe across processes.
///
/// Granularity is one entry, so concurrent builds of different resources
/// proceed in parallel. The lock is released when the value is dropped.
#[derive(Debug)]
pub struct EntryLock {
    file: File,
    path: PathBuf,
}

impl EntryLock {
    /// Take a shared lock on an existing entry, blocking while a writer holds
    /// it exclusively. Returns `None` when the entry does not exist.
    pub fn try_read(path: &Path) -> Result<Option<Self>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(locking(path, err)),
        };
        file.lock_shared().map_err(|err| locking(path, err))?;
        Ok(Some(Self { file, path: path.to_path_buf() }))
    }

    /// Create the entry and take an exclusive lock.
    ///
    /// `create_new` supplies the uniqueness: exactly one caller per path gets
    /// the "I created it" outcome. Returns `None` when someone else already
    /// created the file; the caller should retry as a reader.
    pub fn create_exclusive(path: &Path) -> Result<Option<Self>> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => return Err(locking(path, err)),
        };
        file.lock_exclusive().map_err(|err| locking(path, err))?;
        Ok(Some(Self { file, path: path.to_path_buf() }))
    }

    /// Take an exclusive lock on an existing entry, blocking until every
    /// holder releases it. Used to rebuild invalid or stale entries in place.
    /// Returns `None` when the entry no longer exists.
    pub fn reclaim_exclusive(path: &Path) -> Result<Option<Self>> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(locking(path, err)),
        };
        file.lock_exclusive().map_err(|err| locking(path, err))?;
        Ok(Some(Self { file, path: path.to_path_buf() }))
    }

    /// Convert an exclusive lock to a shared one on the same descriptor.
    ///
    /// The conversion is atomic, so a finished writer hands readability off
    /// without a window in which an evictor could delete the entry.
    pub fn downgrade(&self) -> Result<()> {
        self.file.lock_shared().map_err(|err| locking(&self.path, err))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn locking(path: &Path, source: io::Error) -> CacheError {
    CacheError::Locking { path: path.to_path_buf(), source }
}
