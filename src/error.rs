//! Error taxonomy for the attach handshakes and command protocols.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Everything that can go wrong while attaching to a target VM or talking
/// to it. Each variant is fatal to the current operation; nothing is
/// retried internally beyond the explicit retry policies of the handshakes.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("attach is only supported on POSIX hosts")]
    UnsupportedPlatform,

    #[error("invalid target process id: {0:?}")]
    InvalidProcessId(String),

    #[error("could not create attach sentinel {path}: {source}")]
    SentinelCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not signal target process {pid} (errno {errno})")]
    SignalFailed { pid: String, errno: i32 },

    #[error("target VM {pid} did not create its attach endpoint in time")]
    TargetUnresponsive { pid: String },

    #[error("could not connect to attach endpoint {endpoint}: {source}")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("protocol version mismatch with target VM")]
    ProtocolMismatch,

    #[error("target VM rejected the agent: {message}")]
    AgentRejected { message: String },

    #[error("unexpected response from target VM: {payload:?}")]
    UnexpectedResponse { payload: String },

    #[error("no advertisement for process {pid} in {directory}")]
    TargetNotAdvertised { pid: String, directory: PathBuf },

    #[error("peer answered without the expected nonce: {payload:?}")]
    NonceMismatch { payload: String },

    #[error("short write on attach connection")]
    IoShort,

    #[error("i/o error during attach: {0}")]
    Io(#[from] io::Error),

    #[error("virtual machine is already detached")]
    AlreadyDetached,
}

pub type Result<T> = std::result::Result<T, AttachError>;
