//! OpenJ9 attach: advertisement-directory rendezvous, reply nonce, and the
//! ATTACH_* command protocol.
//!
//! Every OpenJ9 VM advertises itself as a subdirectory of a shared
//! directory. The attacher takes the directory's global `_attachlock`,
//! scans the advertisements under the nested `_master` lock, publishes a
//! secret nonce plus a loopback TCP port into the target's `replyInfo`,
//! wakes all advertised VMs through the `_notifier` semaphore, and waits
//! for the target to call back with the nonce. Unwinding (semaphore, peer
//! sync locks, `replyInfo`, server socket, `_attachlock`) happens in strict
//! reverse order on success and failure alike, which the guard declaration
//! order below encodes.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::cleanup;
use crate::connection::{read_nul_terminated, write_nul_terminated, Connection, TcpConnection};
use crate::error::{AttachError, Result};
use crate::lockfile::FileLock;
use crate::posix::{SyscallSurface, ESRCH};

/// Environment override naming the advertisement directory.
pub const ADVERTISEMENT_DIR_ENV: &str = "com.ibm.tools.attach.directory";
const DEFAULT_ADVERTISEMENT_DIR: &str = "/tmp/.com_ibm_tools_attach";

const ATTACH_LOCK_NAME: &str = "_attachlock";
const MASTER_LOCK_NAME: &str = "_master";
const NOTIFIER_NAME: &str = "_notifier";
const SYNC_FILE_NAME: &str = "attachNotificationSync";
const ATTACH_INFO_NAME: &str = "attachInfo";
const REPLY_INFO_NAME: &str = "replyInfo";
const TRASH_PREFIX: &str = ".trash_";

const PROCESS_ID_KEY: &str = "processId";
const USER_UID_KEY: &str = "userUid";
const SYNC_FILE_KEY: &str = "attachNotificationSync";

const ACK_PREFIX: &str = "ATTACH_ACK";
const RESULT_PREFIX: &str = "ATTACH_RESULT=";
const ERROR_PREFIX: &str = "ATTACH_ERR";
const DETACH_COMMAND: &str = "ATTACH_DETACH";

/// Knobs for the OpenJ9 handshake.
#[derive(Debug, Clone)]
pub struct OpenJ9Options {
    /// Advertisement directory; `None` consults [`ADVERTISEMENT_DIR_ENV`]
    /// and falls back to the shared default under `/tmp`.
    pub directory: Option<PathBuf>,
    /// Bound on waiting for the woken target to call back.
    pub timeout: Duration,
}

impl Default for OpenJ9Options {
    fn default() -> Self {
        OpenJ9Options {
            directory: None,
            timeout: Duration::from_millis(5000),
        }
    }
}

/// One VM's advertisement subdirectory, parsed from its `attachInfo`.
#[derive(Debug)]
struct VmAdvertisement {
    directory: PathBuf,
    properties: HashMap<String, String>,
}

impl VmAdvertisement {
    fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    fn process_id(&self) -> &str {
        self.property(PROCESS_ID_KEY).unwrap_or("")
    }
}

/// An attached OpenJ9-family session.
pub struct OpenJ9Vm {
    connection: Box<dyn Connection>,
}

impl std::fmt::Debug for OpenJ9Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenJ9Vm").finish_non_exhaustive()
    }
}

impl OpenJ9Vm {
    /// Attach to `process_id` with the default directory and timeout.
    pub fn attach(process_id: &str, surface: Arc<dyn SyscallSurface>) -> Result<Self> {
        Self::attach_with(process_id, OpenJ9Options::default(), surface)
    }

    /// Run the full rendezvous against `process_id`.
    pub fn attach_with(
        process_id: &str,
        options: OpenJ9Options,
        surface: Arc<dyn SyscallSurface>,
    ) -> Result<Self> {
        crate::ensure_posix()?;
        let directory = advertisement_directory(&options);
        debug!(
            "attaching to OpenJ9 VM {process_id} via {}",
            directory.display()
        );

        // Phase A: serialize against every other attacher on the host.
        let _attach_lock = FileLock::acquire(&directory.join(ATTACH_LOCK_NAME))?;

        // Phase B: scan advertisements (takes and releases _master).
        let machines = scan_advertisements(&directory, surface.as_ref())?;

        // Phase C: locate the target.
        let target = machines
            .iter()
            .find(|vm| vm.process_id().eq_ignore_ascii_case(process_id))
            .ok_or_else(|| AttachError::TargetNotAdvertised {
                pid: process_id.to_string(),
                directory: directory.clone(),
            })?;

        // Phase D: publish the callback endpoint and secret.
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        let nonce = format!("{:x}", OsRng.next_u64());
        let reply_path = target.directory.join(REPLY_INFO_NAME);
        // Armed before publication so a partial write still gets cleaned up.
        let _reply = RemoveOnDrop::new(&reply_path);
        publish_reply(&reply_path, &nonce, port, surface.as_ref())?;

        // Phase E: hold peers back, then wake everyone.
        let _sync_locks = lock_peer_sync_files(&directory, &machines, surface.as_ref());
        let notifiable = notifiable_items(&directory);
        surface.notify_vm(&directory, NOTIFIER_NAME, notifiable)?;
        let _notified = NotifyGuard {
            surface: surface.as_ref(),
            directory: &directory,
            count: notifiable,
        };

        // Phase F: the target reads replyInfo and calls back with the nonce.
        let stream = accept_within(&listener, options.timeout, process_id)?;
        let mut connection = TcpConnection::new(stream);
        let answer = read_nul_terminated(&mut connection)?;
        if !answer.contains(&format!(" {nonce} ")) {
            return Err(AttachError::NonceMismatch { payload: answer });
        }
        debug!("OpenJ9 VM {process_id} called back on port {port}");
        Ok(OpenJ9Vm {
            connection: Box::new(connection),
        })
        // Phase G runs in the guards' drops, in reverse declaration order:
        // semaphore decrement, sync locks, replyInfo, listener, _attachlock.
    }

    /// Ask the target to load a bytecode instrumentation agent.
    pub fn load_agent(&mut self, jar: &str, argument: Option<&str>) -> Result<()> {
        let command = format!(
            "ATTACH_LOADAGENT(instrument,{jar}={})",
            argument.unwrap_or("")
        );
        let answer = self.command(&command)?;
        expect_ack(answer)
    }

    /// Ask the target to load a native agent library.
    pub fn load_agent_path(&mut self, library: &str, argument: Option<&str>) -> Result<()> {
        let command = match argument {
            Some(argument) => format!("ATTACH_LOADAGENTPATH({library},{argument})"),
            None => format!("ATTACH_LOADAGENTPATH({library})"),
        };
        let answer = self.command(&command)?;
        expect_ack(answer)
    }

    /// Tell the target we are leaving, then close the socket. The target's
    /// reply is read but carries no meaning for us.
    pub fn detach(mut self) -> Result<()> {
        let outcome = self.command(DETACH_COMMAND);
        self.connection.close();
        outcome.map(|_| ())
    }

    fn command(&mut self, payload: &str) -> Result<String> {
        write_nul_terminated(self.connection.as_mut(), payload)?;
        read_nul_terminated(self.connection.as_mut())
    }
}

fn expect_ack(answer: String) -> Result<()> {
    if answer.starts_with(ERROR_PREFIX) {
        Err(AttachError::AgentRejected { message: answer })
    } else if answer.starts_with(ACK_PREFIX) || answer.starts_with(RESULT_PREFIX) {
        Ok(())
    } else {
        Err(AttachError::UnexpectedResponse { payload: answer })
    }
}

fn advertisement_directory(options: &OpenJ9Options) -> PathBuf {
    if let Some(directory) = &options.directory {
        return directory.clone();
    }
    match std::env::var(ADVERTISEMENT_DIR_ENV) {
        Ok(directory) if !directory.is_empty() => PathBuf::from(directory),
        _ => PathBuf::from(DEFAULT_ADVERTISEMENT_DIR),
    }
}

/// Scan the advertisement directory for live VMs, garbage-collecting dead
/// ones we own. Runs under the `_master` lock; the caller already holds
/// `_attachlock`.
fn scan_advertisements(
    directory: &Path,
    surface: &dyn SyscallSurface,
) -> Result<Vec<VmAdvertisement>> {
    let _master = FileLock::acquire(&directory.join(MASTER_LOCK_NAME))?;
    let uid = surface.uid();
    let mut machines = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let vm_dir = entry.path();
        if !vm_dir.is_dir() {
            continue;
        }
        if uid != 0 {
            match surface.owner_of(&vm_dir) {
                Ok(owner) if owner == uid => {}
                _ => continue,
            }
        }
        let info_path = vm_dir.join(ATTACH_INFO_NAME);
        if !info_path.is_file() {
            continue;
        }
        let properties = parse_properties(&fs::read_to_string(&info_path)?);
        let advertisement = VmAdvertisement {
            directory: vm_dir,
            properties,
        };

        // processId 0 marks a VM that has advertised but not yet been
        // assigned a pid; such entries are always kept.
        let process_id: i64 = advertisement.process_id().parse().unwrap_or(0);
        let mut target_uid: u64 = advertisement
            .property(USER_UID_KEY)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        if uid != 0 && process_id == 0 {
            target_uid = surface.owner_of(&info_path).unwrap_or(target_uid);
        }

        let alive = process_id == 0 || surface.kill(process_id, 0) != Err(ESRCH);
        if alive {
            machines.push(advertisement);
        } else if uid == 0 || target_uid == uid {
            debug!(
                "garbage-collecting stale advertisement {}",
                advertisement.directory.display()
            );
            collect_stale(&advertisement.directory);
        }
    }
    Ok(machines)
}

/// Delete a dead VM's advertisement files, then the directory itself.
/// Failures defer to the delete-on-exit registry.
fn collect_stale(vm_dir: &Path) {
    if let Ok(entries) = fs::read_dir(vm_dir) {
        for entry in entries.flatten() {
            cleanup::remove_or_defer(&entry.path());
        }
    }
    cleanup::remove_dir_or_defer(vm_dir);
}

/// Parse advertisement `key=value` text. Blank lines and `#`/`!` comment
/// lines are ignored; whitespace around keys and values is trimmed.
fn parse_properties(text: &str) -> HashMap<String, String> {
    let mut properties = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            properties.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    properties
}

/// Create `replyInfo`, clamp it to owner-only access, then write the nonce
/// and callback port. The 0600 mode is the nonce's only secrecy boundary.
fn publish_reply(path: &Path, nonce: &str, port: u16, surface: &dyn SyscallSurface) -> Result<()> {
    fs::File::create(path)?;
    surface.chmod(path, 0o600)?;
    fs::write(path, format!("{nonce}\n{port}\n"))?;
    Ok(())
}

/// Take the write lock on every peer's sync file so the woken VMs inspect
/// their directories one at a time. Locks that cannot be obtained are
/// skipped; the rendezvous tolerates unsynchronized peers.
fn lock_peer_sync_files(
    directory: &Path,
    machines: &[VmAdvertisement],
    surface: &dyn SyscallSurface,
) -> Vec<FileLock> {
    let own_pid = surface.pid().to_string();
    let mut locks = Vec::new();
    for vm in machines {
        if vm.process_id().eq_ignore_ascii_case(&own_pid) {
            continue;
        }
        let sync_path = match vm.property(SYNC_FILE_KEY) {
            Some(path) => PathBuf::from(path),
            None => directory.join(SYNC_FILE_NAME),
        };
        match FileLock::try_acquire(&sync_path) {
            Ok(Some(lock)) => locks.push(lock),
            Ok(None) => debug!("peer sync file {} is busy, skipping", sync_path.display()),
            Err(err) => debug!(
                "cannot lock peer sync file {}: {}",
                sync_path.display(),
                err
            ),
        }
    }
    locks
}

/// Count the directory entries a notification must reach: everything except
/// the coordination files and trash left by earlier garbage collections.
fn notifiable_items(directory: &Path) -> usize {
    let Ok(entries) = fs::read_dir(directory) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            !name.starts_with(TRASH_PREFIX)
                && !name.eq_ignore_ascii_case(ATTACH_LOCK_NAME)
                && !name.eq_ignore_ascii_case(MASTER_LOCK_NAME)
                && !name.eq_ignore_ascii_case(NOTIFIER_NAME)
        })
        .count()
}

/// Accept one loopback connection within `timeout`.
///
/// std's `TcpListener` exposes no accept timeout, so the listener runs
/// non-blocking behind a short poll loop.
fn accept_within(listener: &TcpListener, timeout: Duration, process_id: &str) -> Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("accepted attach callback from {peer}");
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(AttachError::TargetUnresponsive {
                        pid: process_id.to_string(),
                    });
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Deletes (or defers deletion of) a file when dropped.
struct RemoveOnDrop {
    path: PathBuf,
}

impl RemoveOnDrop {
    fn new(path: &Path) -> Self {
        RemoveOnDrop {
            path: path.to_path_buf(),
        }
    }
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        cleanup::remove_or_defer(&self.path);
    }
}

/// Undoes the `_notifier` posts when dropped.
struct NotifyGuard<'a> {
    surface: &'a dyn SyscallSurface,
    directory: &'a Path,
    count: usize,
}

impl Drop for NotifyGuard<'_> {
    fn drop(&mut self) {
        self.surface
            .cancel_notify(self.directory, NOTIFIER_NAME, self.count);
    }
}
