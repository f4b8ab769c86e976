//! Single-instance lock
//!
//! Only one sync engine may mutate a base directory's state and download
//! directory at a time. The lock is a kernel advisory `flock` on the lock file,
//! so it disappears with the process that held it, including after a crash or
//! power loss. The PID written into the file is informational only.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::SyncError;

/// Held lock; released when dropped
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    // the flock lives as long as this descriptor
    _file: File,
}

/// Outcome of trying to take the lock
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(InstanceLock),

    /// Another process holds the lock; the PID it recorded, if readable
    HeldBy(Option<u32>),
}

impl InstanceLock {
    /// Try to take the lock at `path` without blocking
    pub fn try_acquire(path: &Path) -> Result<LockAttempt, SyncError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if !try_flock_exclusive(&file)? {
            return Ok(LockAttempt::HeldBy(read_owner(&mut file)));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        debug!("Acquired instance lock {:?}", path);

        Ok(LockAttempt::Acquired(InstanceLock {
            path: path.to_path_buf(),
            _file: file,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_owner(file: &mut File) -> Option<u32> {
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

/// Non-blocking exclusive `flock`; `Ok(false)` when another holder has it
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd is a valid descriptor owned by `file` for the whole call.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}
