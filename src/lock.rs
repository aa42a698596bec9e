//! RAII advisory file locking
//!
//! Wraps the platform natives in a guard that releases on drop, so every
//! success and failure path gives the lock back. Locking is cooperative:
//! it coordinates JSONLT processes that agree to take the lock, nothing
//! else.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{JsonltError, JsonltResult};
use crate::platform::{lock_blocking, try_lock, unlock, LockMode};

/// How long to wait between non-blocking acquisition attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// A held advisory lock over a whole file. Dropping the guard unlocks.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Lock an already-open file.
    ///
    /// With no timeout this blocks until the lock is granted. With a
    /// timeout, acquisition is attempted immediately and then polled until
    /// the deadline; a zero timeout means a single attempt. Timing out is a
    /// lock error carrying the path; the file is left unlocked.
    pub fn acquire(
        file: File,
        path: &Path,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> JsonltResult<FileLock> {
        let io_err = |err: std::io::Error| JsonltError::File {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("lock operation failed: {}", err),
        };

        match timeout {
            None => lock_blocking(&file, mode).map_err(io_err)?,
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if try_lock(&file, mode).map_err(io_err)? {
                        break;
                    }
                    if Instant::now() >= deadline {
                        return Err(JsonltError::Lock {
                            path: path.to_path_buf(),
                            message: format!("timed out after {:?}", timeout),
                        });
                    }
                    std::thread::sleep(RETRY_INTERVAL.min(timeout));
                }
            }
        }

        Ok(FileLock { file, path: path.to_path_buf() })
    }

    /// The locked file handle.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Mutable access for reads/appends performed under the lock.
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Path of the locked file (for diagnostics).
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the descriptor would release the lock anyway; an explicit
        // unlock keeps the release point deterministic.
        let _ = unlock(&self.file);
    }
}
