//! Syscall surface: the small set of POSIX capabilities the handshakes need.
//!
//! Both attach protocols go through this trait rather than calling the C
//! library directly, so tests can substitute a scripted implementation.
//! [`LibcSyscalls`] is the production binding.

use std::io;
use std::path::Path;

/// `errno` value for "no such process"; `kill(pid, 0)` returning it is the
/// liveness probe used when sweeping advertisement directories.
pub const ESRCH: i32 = libc::ESRCH;

/// The POSIX capabilities the attach handshakes depend on.
///
/// File descriptors are plain `i32` handles whose meaning is private to the
/// implementation; the UNIX-stream methods are only ever called with values
/// previously returned by [`SyscallSurface::unix_socket`].
pub trait SyscallSurface: Send + Sync {
    /// Our own process id.
    fn pid(&self) -> u64;

    /// Our own user id.
    fn uid(&self) -> u64;

    /// Send `signal` to `pid`; signal 0 probes existence. `Err` carries the
    /// errno.
    fn kill(&self, pid: i64, signal: i32) -> std::result::Result<(), i32>;

    /// chmod(2).
    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Owner uid of `path`, via stat(2).
    fn owner_of(&self, path: &Path) -> io::Result<u64>;

    /// Create an unconnected UNIX-domain stream socket.
    fn unix_socket(&self) -> io::Result<i32>;

    /// Connect `fd` to the UNIX-domain socket listening at `path`.
    fn unix_connect(&self, fd: i32, path: &Path) -> io::Result<()>;

    /// Read into `buf`; 0 means end-of-stream.
    fn unix_read(&self, fd: i32, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf`, returning how much was accepted.
    fn unix_write(&self, fd: i32, buf: &[u8]) -> io::Result<usize>;

    fn unix_close(&self, fd: i32);

    /// Post `count` times on the named notification semaphore so every VM
    /// advertised under `directory` wakes up and checks for a `replyInfo`.
    fn notify_vm(&self, directory: &Path, name: &str, count: usize) -> io::Result<()>;

    /// Best-effort inverse of [`SyscallSurface::notify_vm`]: take back up to
    /// `count` posts the targets have not consumed.
    fn cancel_notify(&self, directory: &Path, name: &str, count: usize);
}

/// Production surface bound to the host C library.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcSyscalls;

#[cfg(unix)]
impl SyscallSurface for LibcSyscalls {
    fn pid(&self) -> u64 {
        unsafe { libc::getpid() as u64 }
    }

    fn uid(&self) -> u64 {
        unsafe { libc::getuid() as u64 }
    }

    fn kill(&self, pid: i64, signal: i32) -> std::result::Result<(), i32> {
        if unsafe { libc::kill(pid as libc::pid_t, signal) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error().raw_os_error().unwrap_or(0))
        }
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        let path = imp::path_cstring(path)?;
        if unsafe { libc::chmod(path.as_ptr(), mode as libc::mode_t) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn owner_of(&self, path: &Path) -> io::Result<u64> {
        use std::os::unix::fs::MetadataExt;
        Ok(std::fs::metadata(path)?.uid() as u64)
    }

    fn unix_socket(&self) -> io::Result<i32> {
        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(fd)
        }
    }

    fn unix_connect(&self, fd: i32, path: &Path) -> io::Result<()> {
        use std::os::unix::ffi::OsStrExt;

        let mut address: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        address.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = path.as_os_str().as_bytes();
        // One byte stays reserved for the NUL terminator.
        if bytes.len() >= address.sun_path.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("socket path too long: {}", path.display()),
            ));
        }
        for (slot, byte) in address.sun_path.iter_mut().zip(bytes) {
            *slot = *byte as libc::c_char;
        }
        let length = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
        let outcome = unsafe {
            libc::connect(fd, &address as *const libc::sockaddr_un as *const libc::sockaddr, length)
        };
        if outcome != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn unix_read(&self, fd: i32, buf: &mut [u8]) -> io::Result<usize> {
        let count = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if count < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(count as usize)
        }
    }

    fn unix_write(&self, fd: i32, buf: &[u8]) -> io::Result<usize> {
        let count = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if count < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(count as usize)
        }
    }

    fn unix_close(&self, fd: i32) {
        unsafe {
            libc::close(fd);
        }
    }

    fn notify_vm(&self, _directory: &Path, name: &str, count: usize) -> io::Result<()> {
        let semaphore = imp::semaphore_open(name, libc::O_CREAT)?;
        for _ in 0..count {
            if unsafe { libc::sem_post(semaphore) } != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::sem_close(semaphore) };
                return Err(err);
            }
        }
        unsafe { libc::sem_close(semaphore) };
        Ok(())
    }

    fn cancel_notify(&self, _directory: &Path, name: &str, count: usize) {
        // The woken targets may already have consumed some posts; draining
        // with sem_trywait takes back whatever is left without blocking.
        let Ok(semaphore) = imp::semaphore_open(name, 0) else {
            return;
        };
        for _ in 0..count {
            if unsafe { libc::sem_trywait(semaphore) } != 0 {
                break;
            }
        }
        unsafe { libc::sem_close(semaphore) };
    }
}

#[cfg(unix)]
mod imp {
    use std::ffi::CString;
    use std::io;
    use std::path::Path;

    pub(super) fn path_cstring(path: &Path) -> io::Result<CString> {
        use std::os::unix::ffi::OsStrExt;
        CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))
    }

    /// Open the named POSIX semaphore backing `_notifier`.
    pub(super) fn semaphore_open(name: &str, flags: libc::c_int) -> io::Result<*mut libc::sem_t> {
        let name = CString::new(format!("/{name}"))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "semaphore name contains NUL"))?;
        let semaphore = unsafe {
            libc::sem_open(name.as_ptr(), flags, 0o666 as libc::c_uint, 0 as libc::c_uint)
        };
        if semaphore == libc::SEM_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(semaphore)
        }
    }
}
