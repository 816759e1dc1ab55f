//! Out-of-band attach client for HotSpot- and OpenJ9-family JVMs.
//!
//! Attaching injects an instrumentation agent (a bytecode bundle or a
//! native shared library) into an already-running VM identified by its
//! process id. The two VM families speak incompatible handshakes:
//!
//! - **HotSpot**: drop a `.attach_pid<pid>` sentinel, send SIGQUIT, then
//!   connect to the UNIX-domain socket the target creates under `/tmp`.
//! - **OpenJ9**: rendezvous through a shared advertisement directory,
//!   publish a secret nonce and loopback port, wake the advertised VMs
//!   via a named semaphore, and accept the target's TCP callback.
//!
//! [`VirtualMachine`] is the entry point:
//!
//! ```no_run
//! use jvm_attach::VirtualMachine;
//!
//! # fn main() -> jvm_attach::Result<()> {
//! let mut vm = VirtualMachine::attach_hotspot("1234")?;
//! vm.load_agent("/opt/agents/tracer.jar", Some("verbose"))?;
//! vm.detach()?;
//! # Ok(())
//! # }
//! ```
//!
//! POSIX only; the caller supplies the target process id.

#[cfg(unix)]
mod cleanup;
pub mod connection;
mod error;
#[cfg(unix)]
pub mod hotspot;
#[cfg(unix)]
mod lockfile;
#[cfg(unix)]
pub mod openj9;
pub mod posix;
#[cfg(test)]
mod test_utils;
#[cfg(unix)]
mod vm;

pub use connection::Connection;
pub use error::{AttachError, Result};
#[cfg(unix)]
pub use hotspot::{HotSpotVm, RetryPolicy};
#[cfg(unix)]
pub use openj9::{OpenJ9Options, OpenJ9Vm, ADVERTISEMENT_DIR_ENV};
#[cfg(unix)]
pub use posix::LibcSyscalls;
pub use posix::{SyscallSurface, ESRCH};
#[cfg(unix)]
pub use vm::VirtualMachine;

/// Fails on hosts without the POSIX facilities the handshakes require.
/// Windows is explicitly unsupported.
pub fn ensure_posix() -> Result<()> {
    if cfg!(unix) {
        Ok(())
    } else {
        Err(AttachError::UnsupportedPlatform)
    }
}
