//! Advisory inter-process lock on a sibling file.
//!
//! The lock is the existence of the file, created with `create_new`. It is
//! held for one read-modify-write cycle of the status cache. Stale locks are
//! not cleaned up: after the timeout the caller proceeds without the lock.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::io_err;
use crate::TaskError;

const RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    held: bool,
}

impl LockFile {
    /// Acquire `path`, waiting up to `timeout` for another holder.
    pub fn acquire(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, TaskError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        let deadline = Instant::now() + timeout;
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path, held: true }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        warn!(
                            "lock {} still held after {:?}, proceeding without it",
                            path.display(),
                            timeout
                        );
                        return Ok(Self { path, held: false });
                    }
                    std::thread::sleep(RETRY_DELAY);
                }
                Err(e) => return Err(io_err(&path, e)),
            }
        }
    }

    pub fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if self.held {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("failed to release lock {}: {e}", self.path.display());
            }
        }
    }
}
