//! Advisory lock guarding a Unix domain socket path
//!
//! A process holding the lock owns the socket path, so it may remove a stale
//! socket file before binding. The lock lives next to the socket as
//! `<path>.lock`.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lock handle recorded on a listener and released when it closes
pub trait FileLocker: Send + Sync + 'static {
    fn release(self: Box<Self>) -> io::Result<()>;
}

/// `flock(2)` based lock file
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Take an exclusive, non-blocking lock for `socket_path`.
    ///
    /// Fails with `WouldBlock` when another process holds it.
    pub fn acquire(socket_path: &Path) -> io::Result<Self> {
        let path = lock_path(socket_path);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        // SAFETY: the descriptor is owned by `file` and stays open for the call
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        debug!(path = %path.display(), "acquired socket lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileLocker for FileLock {
    fn release(self: Box<Self>) -> io::Result<()> {
        // SAFETY: as in `acquire`
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        debug!(path = %self.path.display(), "released socket lock");
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Lock file path for a socket path
pub fn lock_path(socket_path: &Path) -> PathBuf {
    let mut name = socket_path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}
