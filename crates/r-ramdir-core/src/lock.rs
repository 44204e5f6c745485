//! ---
//! ramdir_section: "01-core-functionality"
//! ramdir_subsection: "module"
//! ramdir_type: "source"
//! ramdir_scope: "code"
//! ramdir_description: "Advisory single-instance lock recording the holder's pid."
//! ramdir_version: "v0.0.0-prealpha"
//! ramdir_owner: "tbd"
//! ---
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use r_ramdir_common::LockConfig;
use tracing::{debug, info, warn};

use crate::error::LockError;

/// Process-wide mutual exclusion over a single lock file.
#[derive(Debug, Clone)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_config(config: &LockConfig) -> Self {
        Self::new(config.path.clone())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock without blocking, failing fast if another process holds it.
    ///
    /// The existing file is never truncated before the lock is obtained, so a
    /// refused attempt leaves the holder's pid intact.
    pub fn acquire(&self) -> Result<LockHandle, LockError> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|cause| self.io_error(cause))?;

        if let Err(err) = FileExt::try_lock_exclusive(&file) {
            if is_contended(&err) {
                return Err(LockError::AlreadyRunning {
                    path: self.path.clone(),
                    holder: read_holder(&self.path),
                });
            }
            return Err(self.io_error(err));
        }

        let pid = std::process::id();
        record_pid(&mut file, pid).map_err(|cause| self.io_error(cause))?;
        info!(path = %self.path.display(), pid, "instance lock acquired");
        Ok(LockHandle {
            path: self.path.clone(),
            file: Some(file),
        })
    }

    fn io_error(&self, cause: io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            cause,
        }
    }
}

/// Proof of holding the instance lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    file: Option<File>,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Clear the recorded pid and drop the lock. Calling it again is a no-op.
    pub fn release(&mut self) -> Result<(), LockError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        // The file itself stays; removing it would race a concurrent acquirer.
        let cleared = file.set_len(0);
        let unlocked = FileExt::unlock(&file);
        drop(file);
        cleared
            .and(unlocked)
            .map_err(|cause| LockError::Io {
                path: self.path.clone(),
                cause,
            })?;
        info!(path = %self.path.display(), "instance lock released");
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(error = %err, "failed to release instance lock");
        }
    }
}

/// Pid recorded in the lock file, if one is readable.
pub fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether some process currently holds the lock at `path`.
pub fn is_held(path: &Path) -> Result<bool, LockError> {
    let file = match OpenOptions::new().read(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(cause) => {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                cause,
            })
        }
    };
    match FileExt::try_lock_shared(&file) {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            Ok(false)
        }
        Err(err) if is_contended(&err) => Ok(true),
        Err(cause) => Err(LockError::Io {
            path: path.to_path_buf(),
            cause,
        }),
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn record_pid(file: &mut File, pid: u32) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", pid)?;
    file.sync_data()?;
    debug!(pid, "pid recorded in lock file");
    Ok(())
}
