//! Cross-process file locks.
//!
//! Two independent locks live in the home directory:
//! - the configuration lock, taken around every configuration read-modify
//!   cycle by the daemon and by any tool editing the files;
//! - the single-instance lock, held by the daemon for its whole lifetime.
//!
//! Both are advisory `flock(2)` locks released when the guard is dropped, so
//! every exit path (including errors) releases them.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Exclusive lock on a file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock on `path` is acquired.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        sys::lock(&file, true).map_err(|e| {
            Error::Lock(format!("Failed to lock {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "Lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Take the lock on `path` if nobody holds it; `None` otherwise.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = open_lock_file(path)?;
        match sys::lock(&file, false) {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::Lock(format!(
                "Failed to lock {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the lock file with the id of this process.
    pub fn record_pid(&self) -> Result<()> {
        let mut file = &self.file;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = sys::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %e, "Failed to release lock");
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?)
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    pub fn lock(file: &File, blocking: bool) -> io::Result<()> {
        let operation = if blocking {
            libc::LOCK_EX
        } else {
            libc::LOCK_EX | libc::LOCK_NB
        };
        loop {
            // SAFETY: the descriptor belongs to `file`, which outlives the call.
            #[allow(unsafe_code)]
            let ret = unsafe { libc::flock(file.as_raw_fd(), operation) };
            if ret == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        // SAFETY: the descriptor belongs to `file`, which outlives the call.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use std::fs::{File, TryLockError};
    use std::io;

    pub fn lock(file: &File, blocking: bool) -> io::Result<()> {
        if blocking {
            return file.lock();
        }
        file.try_lock().map_err(|e| match e {
            TryLockError::WouldBlock => io::ErrorKind::WouldBlock.into(),
            TryLockError::Error(e) => e,
        })
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        file.unlock()
    }
}
