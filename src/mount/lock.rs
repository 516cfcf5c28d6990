use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Result, ServicingError};

/// Exclusive advisory lock on a working directory's mount resource.
///
/// The lock is taken on an open file description, so it conflicts both with
/// other processes and with a second acquisition inside this process.
#[derive(Debug)]
pub(crate) struct MountLock {
    file: File,
    path: PathBuf,
}

impl MountLock {
    /// Returns `Ok(None)` when another owner holds the lock.
    pub(crate) fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ServicingError::io(parent, e))?;
        }

        // Never unlink a lock file that may still be held: a second process
        // could then lock a fresh inode at the same path.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| ServicingError::io(path, e))?;

        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }
        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MountLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
