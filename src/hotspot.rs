//! HotSpot attach: sentinel file, SIGQUIT, UNIX-socket rendezvous, and the
//! NUL-delimited load command.
//!
//! The target VM creates `/tmp/.java_pid<pid>` when it receives SIGQUIT
//! while a `.attach_pid<pid>` sentinel exists. The attacher creates the
//! sentinel, signals, polls for the socket under a bounded retry policy,
//! and always removes the sentinel again, whether or not the handshake
//! succeeded.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::debug;

use crate::cleanup;
use crate::connection::{Connection, UnixSocketConnection};
use crate::error::{AttachError, Result};
use crate::posix::SyscallSurface;

const TEMPORARY_DIRECTORY: &str = "/tmp";
const SOCKET_FILE_PREFIX: &str = ".java_pid";
const ATTACH_FILE_PREFIX: &str = ".attach_pid";

const PROTOCOL_VERSION: &str = "1";
const LOAD_COMMAND: &str = "load";
const INSTRUMENT_COMMAND: &str = "instrument";
const ARGUMENT_DELIMITER: &str = "=";
const PROTOCOL_MISMATCH: i32 = 101;

/// Bounded wait for the target to create its attach socket: up to
/// `attempts` existence checks with `pause` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 10,
            pause: Duration::from_millis(100),
        }
    }
}

/// An attached HotSpot-family session.
pub struct HotSpotVm {
    connection: Box<dyn Connection>,
}

impl std::fmt::Debug for HotSpotVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotSpotVm").finish_non_exhaustive()
    }
}

impl HotSpotVm {
    /// Attach to `process_id` with the default retry policy.
    pub fn attach(process_id: &str, surface: Arc<dyn SyscallSurface>) -> Result<Self> {
        Self::attach_with(process_id, RetryPolicy::default(), surface)
    }

    /// Attach to `process_id`, waiting for the target's socket under
    /// `retry`.
    pub fn attach_with(
        process_id: &str,
        retry: RetryPolicy,
        surface: Arc<dyn SyscallSurface>,
    ) -> Result<Self> {
        crate::ensure_posix()?;
        let socket_path =
            Path::new(TEMPORARY_DIRECTORY).join(format!("{SOCKET_FILE_PREFIX}{process_id}"));
        if !socket_path.exists() {
            request_socket(process_id, retry, &socket_path, surface.as_ref())?;
        }
        let connection = UnixSocketConnection::connect(surface, &socket_path)?;
        debug!(
            "attached to HotSpot VM {process_id} via {}",
            socket_path.display()
        );
        Ok(HotSpotVm {
            connection: Box::new(connection),
        })
    }

    /// Ask the target to load a bytecode instrumentation agent.
    pub fn load_agent(&mut self, jar: &str, argument: Option<&str>) -> Result<()> {
        self.load(jar, false, argument)
    }

    /// Ask the target to load a native agent library.
    pub fn load_agent_path(&mut self, library: &str, argument: Option<&str>) -> Result<()> {
        self.load(library, true, argument)
    }

    /// Close the session's endpoint.
    pub fn detach(mut self) {
        self.connection.close();
    }

    fn load(&mut self, file: &str, native: bool, argument: Option<&str>) -> Result<()> {
        let payload = match argument {
            Some(argument) => format!("{file}{ARGUMENT_DELIMITER}{argument}"),
            None => file.to_string(),
        };
        let native_flag = if native { "true" } else { "false" };
        for field in [
            PROTOCOL_VERSION,
            LOAD_COMMAND,
            INSTRUMENT_COMMAND,
            native_flag,
            payload.as_str(),
        ] {
            self.connection.write(field.as_bytes())?;
            self.connection.write(&[0])?;
        }

        let status = self.read_status_line()?;
        let code: i32 = status
            .trim()
            .parse()
            .map_err(|_| AttachError::UnexpectedResponse {
                payload: status.clone(),
            })?;
        match code {
            0 => Ok(()),
            PROTOCOL_MISMATCH => Err(AttachError::ProtocolMismatch),
            _ => {
                let message = self.drain_message()?;
                Err(AttachError::AgentRejected { message })
            }
        }
    }

    /// Read the ASCII decimal status code up to (and excluding) `\n`.
    fn read_status_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let count = self.connection.read(&mut byte)?;
            if count == 0 || byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Read the remainder of the stream: the target's error message after a
    /// rejecting status code.
    fn drain_message(&mut self) -> Result<String> {
        let mut message = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let count = self.connection.read(&mut chunk)?;
            if count == 0 {
                break;
            }
            message.extend_from_slice(&chunk[..count]);
        }
        Ok(String::from_utf8_lossy(&message).into_owned())
    }
}

/// Create the sentinel, signal the target, and wait for its socket. The
/// sentinel is removed (or scheduled for delete-on-exit) on every path.
fn request_socket(
    process_id: &str,
    retry: RetryPolicy,
    socket_path: &Path,
    surface: &dyn SyscallSurface,
) -> Result<()> {
    let pid: i64 = process_id
        .parse()
        .map_err(|_| AttachError::InvalidProcessId(process_id.to_string()))?;
    let sentinel = create_sentinel(process_id)?;
    let outcome = signal_and_wait(pid, process_id, retry, socket_path, surface);
    cleanup::remove_or_defer(&sentinel);
    outcome
}

fn signal_and_wait(
    pid: i64,
    process_id: &str,
    retry: RetryPolicy,
    socket_path: &Path,
    surface: &dyn SyscallSurface,
) -> Result<()> {
    surface
        .kill(pid, libc::SIGQUIT)
        .map_err(|errno| AttachError::SignalFailed {
            pid: process_id.to_string(),
            errno,
        })?;
    debug!("sent SIGQUIT to {process_id}, waiting for {}", socket_path.display());

    let mut attempts = retry.attempts;
    while attempts > 0 && !socket_path.exists() {
        thread::sleep(retry.pause);
        attempts -= 1;
    }
    if socket_path.exists() {
        Ok(())
    } else {
        Err(AttachError::TargetUnresponsive {
            pid: process_id.to_string(),
        })
    }
}

/// Create the sentinel in the target's working directory, falling back to
/// `/tmp` when the procfs path is not writable (or absent).
fn create_sentinel(process_id: &str) -> Result<PathBuf> {
    let name = format!("{ATTACH_FILE_PREFIX}{process_id}");
    let in_cwd = PathBuf::from(format!("/proc/{process_id}/cwd")).join(&name);
    match touch(&in_cwd) {
        Ok(()) => return Ok(in_cwd),
        Err(err) => debug!("cannot create sentinel {}: {}", in_cwd.display(), err),
    }
    let fallback = Path::new(TEMPORARY_DIRECTORY).join(&name);
    match touch(&fallback) {
        Ok(()) => Ok(fallback),
        Err(source) => Err(AttachError::SentinelCreate {
            path: fallback,
            source,
        }),
    }
}

/// Create `path` as an empty file. A file already present is fine (another
/// attacher may have raced us), but anything that is not a regular file is
/// an error.
fn touch(path: &Path) -> io::Result<()> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists && path.is_file() => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{written_bytes, ScriptedConnection};

    fn session(reply: &[u8]) -> (HotSpotVm, std::sync::Arc<std::sync::Mutex<Vec<u8>>>) {
        let connection = ScriptedConnection::replying(reply);
        let sink = connection.sink();
        let vm = HotSpotVm {
            connection: Box::new(connection),
        };
        (vm, sink)
    }

    #[test]
    fn test_load_frames_five_nul_terminated_fields() {
        let (mut vm, sink) = session(b"0\n");
        vm.load("/a.jar", false, Some("opt=1")).unwrap();
        assert_eq!(
            written_bytes(&sink),
            b"1\0load\0instrument\0false\0/a.jar=opt=1\0"
        );
    }

    #[test]
    fn test_load_without_argument_omits_delimiter() {
        let (mut vm, sink) = session(b"0\n");
        vm.load("/agent.so", true, None).unwrap();
        assert_eq!(
            written_bytes(&sink),
            b"1\0load\0instrument\0true\0/agent.so\0"
        );
    }

    #[test]
    fn test_protocol_mismatch_code_is_its_own_error() {
        let (mut vm, _sink) = session(b"101\n");
        let err = vm.load("/a.jar", false, None).unwrap_err();
        assert!(matches!(err, AttachError::ProtocolMismatch));
    }

    #[test]
    fn test_rejecting_code_carries_trailing_message() {
        let (mut vm, _sink) = session(b"2\nagent failed to initialize");
        let err = vm.load("/a.jar", false, None).unwrap_err();
        match err {
            AttachError::AgentRejected { message } => {
                assert_eq!(message, "agent failed to initialize");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_garbage_status_is_unexpected_response() {
        let (mut vm, _sink) = session(b"ok\n");
        let err = vm.load("/a.jar", false, None).unwrap_err();
        assert!(matches!(err, AttachError::UnexpectedResponse { .. }));
    }

    #[test]
    fn test_touch_accepts_existing_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".attach_pid1");
        touch(&path).unwrap();
        touch(&path).unwrap();
    }

    #[test]
    fn test_touch_rejects_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".attach_pid1");
        std::fs::create_dir(&path).unwrap();
        assert!(touch(&path).is_err());
    }

    #[test]
    fn test_default_retry_policy_matches_attach_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 10);
        assert_eq!(policy.pause, Duration::from_millis(100));
    }
}
