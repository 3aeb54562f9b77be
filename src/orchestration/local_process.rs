//! Host process runtime
//!
//! Runs service commands directly on the host with no isolation. Useful for
//! development machines without Podman; images and cache mounts are ignored.

use crate::error::{CorralError, CorralResult};
use crate::orchestration::dial::dial_address;
use crate::orchestration::exec::ExecSpec;
use crate::orchestration::runtime::{
    OutputStream, ProcessExit, ProcessHandle, Runtime, Signal, StartedProcess,
};
use crate::service::Port;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// A host process the runtime started and has not yet released
struct Tracked {
    pid: u32,
    /// Cleared by the reaper once the process has been waited on, so a
    /// recycled PID is never signaled
    alive: Arc<AtomicBool>,
}

/// Runtime that spawns services as plain host processes
pub struct HostProcessRuntime {
    processes: Mutex<HashMap<String, Tracked>>,
}

impl HostProcessRuntime {
    /// Create a new host process runtime
    pub fn new() -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
        }
    }

    fn command_for(args: &[String]) -> CorralResult<Command> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| CorralError::ContainerStart("empty command".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(rest);
        Ok(cmd)
    }
}

impl Default for HostProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for HostProcessRuntime {
    async fn is_available(&self) -> CorralResult<bool> {
        Ok(cfg!(unix))
    }

    async fn ensure_ready(&self) -> CorralResult<()> {
        if cfg!(unix) {
            Ok(())
        } else {
            Err(CorralError::UnsupportedBackend("process".to_string()))
        }
    }

    async fn start(&self, spec: &ExecSpec) -> CorralResult<StartedProcess> {
        if !spec.caches.is_empty() || !spec.volumes.is_empty() {
            warn!(
                "Host process backend ignores mounts for {}",
                spec.hostname
            );
        }

        let mut cmd = Self::command_for(&spec.args)?;
        cmd.envs(&spec.env)
            .env("HOSTNAME", &spec.hostname)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(workdir) = &spec.workdir {
            cmd.current_dir(workdir);
        }

        debug!("Spawning host process: {}", spec.command_line());
        let mut child = cmd
            .spawn()
            .map_err(|e| CorralError::command_failed(spec.command_line(), e))?;

        let pid = child
            .id()
            .ok_or_else(|| CorralError::ContainerStart("process exited during spawn".to_string()))?;
        let handle = ProcessHandle {
            id: format!("pid-{}", pid),
            pid: Some(pid),
        };

        let stdout = child.stdout.take().map(|s| Box::new(s) as OutputStream);
        let stderr = child.stderr.take().map(|s| Box::new(s) as OutputStream);

        let alive = Arc::new(AtomicBool::new(true));
        self.processes.lock().insert(
            handle.id.clone(),
            Tracked {
                pid,
                alive: Arc::clone(&alive),
            },
        );

        let (tx, exited) = oneshot::channel();
        tokio::spawn(async move {
            let status = child.wait().await;
            alive.store(false, Ordering::SeqCst);
            let code = status.ok().and_then(|s| s.code());
            let _ = tx.send(ProcessExit { code });
        });

        info!("Process started: {}", handle);
        Ok(StartedProcess {
            handle,
            stdout,
            stderr,
            exited,
        })
    }

    async fn signal(&self, handle: &ProcessHandle, signal: Signal) -> CorralResult<()> {
        let pid = {
            let processes = self.processes.lock();
            match processes.get(&handle.id) {
                Some(tracked) if tracked.alive.load(Ordering::SeqCst) => tracked.pid,
                _ => return Ok(()),
            }
        };

        debug!("Sending SIG{} to {}", signal.name(), handle);
        // SAFETY: kill(2) has no memory-safety preconditions; the PID is
        // still ours because the reaper has not collected it yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal.number()) };
        if rc == 0 {
            Ok(())
        } else {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                Ok(())
            } else {
                Err(CorralError::io(format!("signal {}", handle), err))
            }
        }
    }

    async fn release(&self, handle: &ProcessHandle) -> CorralResult<()> {
        self.processes.lock().remove(&handle.id);
        Ok(())
    }

    async fn exec(&self, _handle: &ProcessHandle, args: &[String]) -> CorralResult<i32> {
        let mut cmd = Self::command_for(args)?;
        let status = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| CorralError::command_failed(args.join(" "), e))?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn dial(
        &self,
        _handle: &ProcessHandle,
        port: &Port,
        timeout: Duration,
    ) -> CorralResult<()> {
        // Host processes share the host's network namespace
        dial_address("127.0.0.1", port, timeout).await
    }

    async fn network_address(&self, _handle: &ProcessHandle) -> CorralResult<String> {
        Ok("127.0.0.1".to_string())
    }

    fn runtime_name(&self) -> &'static str {
        "Host process"
    }
}
