//! Byte-stream backends shared by both attach protocols.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use crate::error::{AttachError, Result};
use crate::posix::SyscallSurface;

/// A connected byte stream to the target VM.
///
/// `read` returns 0 at end-of-stream. `write` must place the entire buffer;
/// a short write is fatal to the session.
pub trait Connection: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<()>;
    fn close(&mut self);
}

/// UNIX-domain stream over the syscall surface (HotSpot).
pub struct UnixSocketConnection {
    surface: Arc<dyn SyscallSurface>,
    fd: i32,
    open: bool,
}

impl UnixSocketConnection {
    /// Open a socket and connect it to the listener at `path`.
    pub(crate) fn connect(surface: Arc<dyn SyscallSurface>, path: &Path) -> Result<Self> {
        let fd = surface.unix_socket().map_err(|source| AttachError::ConnectFailed {
            endpoint: path.display().to_string(),
            source,
        })?;
        if let Err(source) = surface.unix_connect(fd, path) {
            surface.unix_close(fd);
            return Err(AttachError::ConnectFailed {
                endpoint: path.display().to_string(),
                source,
            });
        }
        Ok(UnixSocketConnection {
            surface,
            fd,
            open: true,
        })
    }
}

impl Connection for UnixSocketConnection {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.surface.unix_read(self.fd, buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let written = self.surface.unix_write(self.fd, buf)?;
        if written != buf.len() {
            return Err(AttachError::IoShort);
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.surface.unix_close(self.fd);
            self.open = false;
        }
    }
}

impl Drop for UnixSocketConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// TCP loopback stream (OpenJ9).
pub struct TcpConnection {
    stream: TcpStream,
    open: bool,
}

impl TcpConnection {
    pub(crate) fn new(stream: TcpStream) -> Self {
        TcpConnection { stream, open: true }
    }
}

impl Connection for TcpConnection {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.stream.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).map_err(|err| match err.kind() {
            io::ErrorKind::WriteZero => AttachError::IoShort,
            _ => AttachError::Io(err),
        })
    }

    fn close(&mut self) {
        if self.open {
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
            self.open = false;
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read one NUL-terminated UTF-8 message. End-of-stream before the
/// terminator yields whatever was read.
pub(crate) fn read_nul_terminated(connection: &mut dyn Connection) -> Result<String> {
    let mut message = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let count = connection.read(&mut byte)?;
        if count == 0 || byte[0] == 0 {
            break;
        }
        message.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&message).into_owned())
}

/// Write one NUL-terminated UTF-8 message.
pub(crate) fn write_nul_terminated(connection: &mut dyn Connection, payload: &str) -> Result<()> {
    connection.write(payload.as_bytes())?;
    connection.write(&[0])
}
