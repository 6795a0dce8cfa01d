//! App-wide advisory file lock
//!
//! One synchronizer instance owns the state directory at a time,
//! enforced with `flock(2)` on a lockfile next to it. The lock is
//! released when the guard is dropped (or the process exits).

use crate::error::{Error, Result};
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Held for the duration of one command.
#[derive(Debug)]
pub struct AppLock {
    _file: File,
    path: PathBuf,
}

impl AppLock {
    /// Lockfile location for a given state directory:
    /// `<state_dir>/../.norless-lock`.
    #[must_use]
    pub fn path_for(state_dir: &Path) -> PathBuf {
        state_dir
            .parent()
            .unwrap_or(state_dir)
            .join(".norless-lock")
    }

    /// Take the lock, waiting when `block` is set. A held lock
    /// surfaces as [`Error::LockContention`] so callers can exit with
    /// a distinguishing status.
    pub fn acquire(path: &Path, block: bool) -> Result<Self> {
        let file = File::create(path)?;
        let mut op = libc::LOCK_EX;
        if !block {
            op |= libc::LOCK_NB;
        }

        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(Error::LockContention(path.to_path_buf()));
            }
            return Err(err.into());
        }

        debug!("acquired app lock at {}", path.display());
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    /// The lockfile path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
