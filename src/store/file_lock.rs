//! Cross-process advisory lock over the snapshot file.
//!
//! The lock is a marker file created with `O_CREAT | O_EXCL` next to the snapshot. Holding it
//! means owning the right to reload and rewrite the snapshot; dropping the guard deletes it.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::StoreError;

/// Suffix appended to the snapshot path to name its lock marker.
pub const LOCK_SUFFIX: &str = ".lock";

/// How long to wait for another process to release the marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLockPolicy {
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Default for FileLockPolicy {
    fn default() -> Self {
        Self {
            attempts: 200,
            retry_delay: Duration::from_millis(10),
        }
    }
}

pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock_path = path.as_os_str().to_owned();
    lock_path.push(LOCK_SUFFIX);
    PathBuf::from(lock_path)
}

/// A held marker file. Removed on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    _file: File,
}

impl FileLock {
    /// Blocks the current thread, polling at `policy.retry_delay`, until the marker can be
    /// created or `policy.attempts` are used up.
    pub fn acquire(path: &Path, policy: &FileLockPolicy) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        for attempt in 0..policy.attempts {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(file) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                        _file: file,
                    });
                }
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                    if attempt + 1 < policy.attempts {
                        std::thread::sleep(policy.retry_delay);
                    }
                }
                Err(source) => {
                    return Err(StoreError::Io {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }
        }
        Err(StoreError::LockUnavailable {
            path: path.to_path_buf(),
            attempts: policy.attempts,
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %error, "Failed to remove store lock marker");
        }
    }
}
