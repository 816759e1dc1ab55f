//! Advisory whole-file write locks over fcntl(2).
//!
//! The OpenJ9 rendezvous serializes attachers with these locks. The guard
//! releases on drop, so an unwinding handshake unlocks in strict reverse
//! acquisition order.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::debug;

pub(crate) struct FileLock {
    // The descriptor must stay open for the lifetime of the lock.
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Open `path` (creating it if needed) and take the exclusive write
    /// lock, blocking until it is granted.
    pub(crate) fn acquire(path: &Path) -> io::Result<FileLock> {
        let file = open_lockable(path)?;
        set_lock(&file, libc::F_SETLKW, libc::F_WRLCK)?;
        debug!("locked {}", path.display());
        Ok(FileLock {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Like [`FileLock::acquire`] but without blocking; `None` when another
    /// process holds the lock.
    pub(crate) fn try_acquire(path: &Path) -> io::Result<Option<FileLock>> {
        let file = open_lockable(path)?;
        match set_lock(&file, libc::F_SETLK, libc::F_WRLCK) {
            Ok(()) => Ok(Some(FileLock {
                file,
                path: path.to_path_buf(),
            })),
            Err(err) if matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EACCES)) => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = set_lock(&self.file, libc::F_SETLK, libc::F_UNLCK) {
            debug!("unlock of {} failed: {}", self.path.display(), err);
        } else {
            debug!("unlocked {}", self.path.display());
        }
    }
}

fn open_lockable(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
}

fn set_lock(file: &File, operation: libc::c_int, kind: libc::c_int) -> io::Result<()> {
    let mut region: libc::flock = unsafe { std::mem::zeroed() };
    region.l_type = kind as libc::c_short;
    region.l_whence = libc::SEEK_SET as libc::c_short;
    // l_start == 0 and l_len == 0 cover the whole file.
    if unsafe { libc::fcntl(file.as_raw_fd(), operation, &region) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
