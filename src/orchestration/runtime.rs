//! Container runtime abstraction
//!
//! The low-level start collaborator: launches one resource from a fully
//! resolved [`ExecSpec`] and lets the engine signal, release, and probe it
//! independently of the start call.
//! Port probes go through [`Runtime::dial`] so they observe the resource's
//! own network namespace rather than the host's.

use crate::error::CorralResult;
use crate::orchestration::exec::ExecSpec;
use crate::service::Port;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;

/// Opaque reference to a started process or container
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    /// Backend-specific ID (container ID, or `pid-N` for host processes)
    pub id: String,
    /// Host PID, when the backend knows it
    pub pid: Option<u32>,
}

impl ProcessHandle {
    /// First 12 characters of the ID, for display
    pub fn short_id(&self) -> &str {
        &self.id[..12.min(self.id.len())]
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_id())
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, or `None` if terminated by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    /// Exit code as display text
    pub fn describe(&self) -> String {
        match self.code {
            Some(code) => code.to_string(),
            None => "signal".to_string(),
        }
    }
}

/// Signals the engine sends to resources
///
/// Teardown never negotiates, so immediate termination is the only one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Kill,
}

impl Signal {
    /// Signal name as understood by `podman kill --signal`
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Kill => "KILL",
        }
    }

    /// POSIX signal number
    pub fn number(&self) -> i32 {
        match self {
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Output stream of a started process
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Everything the runtime hands back from a successful start
pub struct StartedProcess {
    pub handle: ProcessHandle,
    pub stdout: Option<OutputStream>,
    pub stderr: Option<OutputStream>,
    /// Resolves once when the process terminates, for any reason
    pub exited: oneshot::Receiver<ProcessExit>,
}

/// Abstract container runtime interface
///
/// Implementations:
/// - Rootless Podman (containers)
/// - Host processes (no isolation, for development)
/// - Scripted mock (tests)
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Check if the runtime is available on this system
    async fn is_available(&self) -> CorralResult<bool>;

    /// Ensure the runtime is ready (rootless setup, etc.)
    async fn ensure_ready(&self) -> CorralResult<()>;

    /// Start one resource and return its handle and output streams
    async fn start(&self, spec: &ExecSpec) -> CorralResult<StartedProcess>;

    /// Deliver a signal to a started resource
    async fn signal(&self, handle: &ProcessHandle, signal: Signal) -> CorralResult<()>;

    /// Release the resource's underlying container and storage
    async fn release(&self, handle: &ProcessHandle) -> CorralResult<()>;

    /// Run a command inside the resource's execution context, returning its exit code
    async fn exec(&self, handle: &ProcessHandle, args: &[String]) -> CorralResult<i32>;

    /// Attempt one connection to `port` from inside the resource's network
    /// namespace, giving up after `timeout`
    async fn dial(&self, handle: &ProcessHandle, port: &Port, timeout: Duration)
        -> CorralResult<()>;

    /// Address at which the resource's bound ports are reachable, for display
    async fn network_address(&self, handle: &ProcessHandle) -> CorralResult<String>;

    /// Get the human-readable runtime name for display
    fn runtime_name(&self) -> &'static str;
}
