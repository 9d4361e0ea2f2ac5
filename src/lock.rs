//! The cross-process directory lock (`<dir>/LOCK`). Mandatory within one
//! process, advisory across processes, backed by the same `fs4` whole-file
//! locking the teacher crate already uses for its own log file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use crate::error::{Error, Result};

/// Holds the directory's advisory lock for as long as it lives. Releases
/// the OS lock and removes the lock file on drop.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
    file: Option<File>,
}

impl DirLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join("LOCK");
        let file = OpenOptions::new().write(true).create(true).open(&path).map_err(|e| Error::io("open", &path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(DirLock { path, file: Some(file) }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::AlreadyOpen { path }),
            Err(e) => Err(Error::io("lock", &path, e)),
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
            drop(file);
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
