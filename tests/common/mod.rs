//! Shared fixtures for the handshake integration tests.

// Each test binary uses a different slice of these fixtures.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use jvm_attach::{SyscallSurface, ESRCH};

static LOGGING: Once = Once::new();

/// Route `log` output through the test harness (once per process).
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Scripted syscall surface: records every call, serves a canned UNIX-stream
/// reply, and treats the configured pids as dead.
pub struct MockSyscalls {
    pub pid: u64,
    pub uid: u64,
    pub dead_pids: Vec<i64>,
    pub signals: Mutex<Vec<(i64, i32)>>,
    pub chmods: Mutex<Vec<(PathBuf, u32)>>,
    pub notifications: Mutex<Vec<(String, usize)>>,
    pub cancellations: Mutex<Vec<(String, usize)>>,
    pub unix: Mutex<UnixScript>,
}

/// State of the scripted UNIX-domain stream.
#[derive(Default)]
pub struct UnixScript {
    pub connected_to: Option<PathBuf>,
    pub written: Vec<u8>,
    pub reply: VecDeque<u8>,
}

impl MockSyscalls {
    pub fn new(pid: u64, uid: u64) -> Self {
        MockSyscalls {
            pid,
            uid,
            dead_pids: Vec::new(),
            signals: Mutex::new(Vec::new()),
            chmods: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            cancellations: Mutex::new(Vec::new()),
            unix: Mutex::new(UnixScript::default()),
        }
    }

    /// Same, with a scripted reply for the UNIX-domain stream.
    pub fn with_unix_reply(pid: u64, uid: u64, reply: &[u8]) -> Self {
        let mock = Self::new(pid, uid);
        mock.unix.lock().unwrap().reply = reply.iter().copied().collect();
        mock
    }

    pub fn written(&self) -> Vec<u8> {
        self.unix.lock().unwrap().written.clone()
    }
}

impl SyscallSurface for MockSyscalls {
    fn pid(&self) -> u64 {
        self.pid
    }

    fn uid(&self) -> u64 {
        self.uid
    }

    fn kill(&self, pid: i64, signal: i32) -> Result<(), i32> {
        self.signals.lock().unwrap().push((pid, signal));
        if self.dead_pids.contains(&pid) {
            Err(ESRCH)
        } else {
            Ok(())
        }
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        self.chmods.lock().unwrap().push((path.to_path_buf(), mode));
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }

    fn owner_of(&self, _path: &Path) -> io::Result<u64> {
        // Advertisement fixtures are created by the test process; report
        // them as owned by the mocked uid.
        Ok(self.uid)
    }

    fn unix_socket(&self) -> io::Result<i32> {
        Ok(99)
    }

    fn unix_connect(&self, _fd: i32, path: &Path) -> io::Result<()> {
        self.unix.lock().unwrap().connected_to = Some(path.to_path_buf());
        Ok(())
    }

    fn unix_read(&self, _fd: i32, buf: &mut [u8]) -> io::Result<usize> {
        let mut unix = self.unix.lock().unwrap();
        let mut count = 0;
        while count < buf.len() {
            match unix.reply.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }

    fn unix_write(&self, _fd: i32, buf: &[u8]) -> io::Result<usize> {
        self.unix.lock().unwrap().written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn unix_close(&self, _fd: i32) {}

    fn notify_vm(&self, _directory: &Path, name: &str, count: usize) -> io::Result<()> {
        self.notifications
            .lock()
            .unwrap()
            .push((name.to_string(), count));
        Ok(())
    }

    fn cancel_notify(&self, _directory: &Path, name: &str, count: usize) {
        self.cancellations
            .lock()
            .unwrap()
            .push((name.to_string(), count));
    }
}

/// Publish an advertisement subdirectory the way a target VM would.
pub fn advertise(directory: &Path, vm_id: &str, attach_info: &str) -> PathBuf {
    let vm_dir = directory.join(vm_id);
    fs::create_dir_all(&vm_dir).unwrap();
    fs::write(vm_dir.join("attachInfo"), attach_info).unwrap();
    vm_dir
}

/// Removes a file when dropped; keeps `/tmp` fixtures from outliving a test.
pub struct RemoveGuard(pub PathBuf);

impl Drop for RemoveGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

/// Fake pids above the default Linux `pid_max` (4194304), salted per test
/// so parallel tests never share `/tmp` fixture paths.
pub fn fake_pid(salt: u32) -> String {
    format!("{}", 5_000_000 + u64::from(salt) * 100_000 + u64::from(std::process::id() % 100_000))
}

/// Wait for the attacher to publish `replyInfo`, then return its nonce,
/// port, and on-disk mode.
pub fn await_reply_info(path: &Path) -> anyhow::Result<(String, u16, u32)> {
    use std::os::unix::fs::PermissionsExt;

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(text) = fs::read_to_string(path) {
            // Both lines must be complete before the contents are usable.
            if text.ends_with('\n') {
                let mut lines = text.lines();
                if let (Some(nonce), Some(port)) = (lines.next(), lines.next()) {
                    if let Ok(port) = port.parse::<u16>() {
                        let mode = fs::metadata(path)?.permissions().mode() & 0o777;
                        return Ok((nonce.to_string(), port, mode));
                    }
                }
            }
        }
        if Instant::now() > deadline {
            bail!("replyInfo never appeared at {}", path.display());
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Read one NUL-terminated message; `None` at end-of-stream.
pub fn read_message(stream: &mut TcpStream) -> anyhow::Result<Option<String>> {
    let mut message = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let count = stream.read(&mut byte)?;
        if count == 0 {
            return Ok(None);
        }
        if byte[0] == 0 {
            return Ok(Some(String::from_utf8_lossy(&message).into_owned()));
        }
        message.push(byte[0]);
    }
}

/// Play the target VM: wake on `replyInfo`, call back with `greeting`
/// (`{nonce}` substituted), then acknowledge commands until detach.
pub fn spawn_target_vm(
    reply_path: PathBuf,
    greeting: &'static str,
) -> JoinHandle<anyhow::Result<(Vec<String>, u32)>> {
    thread::spawn(move || {
        let (nonce, port, mode) = await_reply_info(&reply_path)?;
        let mut stream =
            TcpStream::connect(("127.0.0.1", port)).context("callback connect failed")?;
        let greeting = greeting.replace("{nonce}", &nonce);
        stream.write_all(greeting.as_bytes())?;
        stream.write_all(&[0])?;

        let mut commands = Vec::new();
        while let Some(command) = read_message(&mut stream)? {
            let done = command == "ATTACH_DETACH";
            commands.push(command);
            stream.write_all(b"ATTACH_ACK\0")?;
            if done {
                break;
            }
        }
        Ok((commands, mode))
    })
}
