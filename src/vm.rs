//! Client facade over the two attach strategies.

use std::sync::Arc;

use log::debug;

use crate::error::{AttachError, Result};
use crate::hotspot::{HotSpotVm, RetryPolicy};
use crate::openj9::{OpenJ9Options, OpenJ9Vm};
use crate::posix::{LibcSyscalls, SyscallSurface};

/// A session with one target VM.
///
/// Obtained from one of the `attach*` constructors. Load operations fail
/// with [`AttachError::AlreadyDetached`] once [`VirtualMachine::detach`]
/// has run; a second `detach` is a no-op.
///
/// Commands are strict request/response; a `VirtualMachine` must not be
/// shared across threads without external mutual exclusion.
pub struct VirtualMachine {
    session: Option<Session>,
}

enum Session {
    HotSpot(HotSpotVm),
    OpenJ9(OpenJ9Vm),
}

impl VirtualMachine {
    /// Attach to a HotSpot-family VM with the default retry policy.
    pub fn attach_hotspot(process_id: &str) -> Result<Self> {
        Self::attach_hotspot_with(process_id, RetryPolicy::default(), Arc::new(LibcSyscalls))
    }

    /// Attach to a HotSpot-family VM with an explicit retry policy and
    /// syscall surface.
    pub fn attach_hotspot_with(
        process_id: &str,
        retry: RetryPolicy,
        surface: Arc<dyn SyscallSurface>,
    ) -> Result<Self> {
        Ok(Self::wrap(Session::HotSpot(HotSpotVm::attach_with(
            process_id, retry, surface,
        )?)))
    }

    /// Attach to an OpenJ9-family VM with the default directory and
    /// timeout.
    pub fn attach_openj9(process_id: &str) -> Result<Self> {
        Self::attach_openj9_with(process_id, OpenJ9Options::default(), Arc::new(LibcSyscalls))
    }

    /// Attach to an OpenJ9-family VM with explicit options and syscall
    /// surface.
    pub fn attach_openj9_with(
        process_id: &str,
        options: OpenJ9Options,
        surface: Arc<dyn SyscallSurface>,
    ) -> Result<Self> {
        Ok(Self::wrap(Session::OpenJ9(OpenJ9Vm::attach_with(
            process_id, options, surface,
        )?)))
    }

    /// Attach to a VM of unknown family: try the HotSpot handshake first,
    /// then the OpenJ9 rendezvous.
    pub fn attach(process_id: &str) -> Result<Self> {
        Self::attach_with(
            process_id,
            RetryPolicy::default(),
            OpenJ9Options::default(),
            Arc::new(LibcSyscalls),
        )
    }

    /// Family probe with explicit knobs for both handshakes.
    pub fn attach_with(
        process_id: &str,
        retry: RetryPolicy,
        options: OpenJ9Options,
        surface: Arc<dyn SyscallSurface>,
    ) -> Result<Self> {
        match Self::attach_hotspot_with(process_id, retry, Arc::clone(&surface)) {
            Ok(vm) => Ok(vm),
            Err(hotspot_error) => {
                debug!("HotSpot attach to {process_id} failed ({hotspot_error}), trying OpenJ9");
                Self::attach_openj9_with(process_id, options, surface)
            }
        }
    }

    /// Ask the target to load a bytecode instrumentation agent.
    pub fn load_agent(&mut self, jar: &str, argument: Option<&str>) -> Result<()> {
        match self.session_mut()? {
            Session::HotSpot(vm) => vm.load_agent(jar, argument),
            Session::OpenJ9(vm) => vm.load_agent(jar, argument),
        }
    }

    /// Ask the target to load a native agent library.
    pub fn load_agent_path(&mut self, library: &str, argument: Option<&str>) -> Result<()> {
        match self.session_mut()? {
            Session::HotSpot(vm) => vm.load_agent_path(library, argument),
            Session::OpenJ9(vm) => vm.load_agent_path(library, argument),
        }
    }

    /// Close the session's endpoint.
    pub fn detach(&mut self) -> Result<()> {
        match self.session.take() {
            Some(Session::HotSpot(vm)) => {
                vm.detach();
                Ok(())
            }
            Some(Session::OpenJ9(vm)) => vm.detach(),
            None => Ok(()),
        }
    }

    fn wrap(session: Session) -> Self {
        VirtualMachine {
            session: Some(session),
        }
    }

    fn session_mut(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or(AttachError::AlreadyDetached)
    }
}
