//! Native Podman container runtime for Linux
//!
//! Implements the Runtime trait using direct Podman execution without a VM
//! layer. Requires rootless Podman to be properly configured.
//!
//! Services join one DNS-enabled network under their full hostname, so
//! dependents resolve them by name. Port dials run in a short-lived
//! container that shares the service's network namespace.

use crate::config::schema::RuntimeConfig;
use crate::error::{CorralError, CorralResult};
use crate::orchestration::exec::ExecSpec;
use crate::orchestration::runtime::{
    OutputStream, ProcessExit, ProcessHandle, Runtime, Signal, StartedProcess,
};
use crate::service::{NetworkProtocol, Port};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Label marking containers started by corral
const SERVICE_LABEL: &str = "io.corral.service=true";

/// Time allowed for the dial container itself to come up, on top of the
/// dial timeout
const DIAL_STARTUP_ALLOWANCE: Duration = Duration::from_secs(10);

/// Network modes podman provides itself; anything else is a named network
const NETWORK_MODES: &[&str] = &["host", "none", "private", "slirp4netns", "pasta"];

/// Container runtime using native rootless Podman
pub struct NativePodmanRuntime {
    network: String,
    dial_image: String,
}

impl NativePodmanRuntime {
    /// Create a native Podman runtime with default settings
    pub fn new() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }

    /// Create a native Podman runtime using the configured network and
    /// dial image
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            network: config.network.clone(),
            dial_image: config.dial_image.clone(),
        }
    }

    /// Whether `network` names a network rather than a namespace mode
    fn is_named_network(network: &str) -> bool {
        !network.is_empty() && !NETWORK_MODES.contains(&network) && !network.contains(':')
    }

    /// Whether `network` is one corral creates; podman's own default
    /// networks come without DNS and are used as they are
    fn is_managed_network(network: &str) -> bool {
        Self::is_named_network(network) && !matches!(network, "bridge" | "podman")
    }

    /// Check if Podman is installed
    async fn podman_installed() -> bool {
        Command::new("podman")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Check if rootless Podman is properly configured
    async fn rootless_configured() -> CorralResult<bool> {
        let output = Command::new("podman")
            .args(["info", "--format", "{{.Host.Security.Rootless}}"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| CorralError::command_failed("podman info", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.trim() == "true")
    }

    /// Execute a Podman command and return the output
    async fn exec_podman(&self, args: &[&str]) -> CorralResult<std::process::Output> {
        debug!("Executing: podman {:?}", args);

        Command::new("podman")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CorralError::command_failed(format!("podman {:?}", args), e))
    }

    /// Create the service network with DNS unless it already exists
    async fn ensure_network(&self) -> CorralResult<()> {
        if !Self::is_managed_network(&self.network) {
            return Ok(());
        }

        let exists = self.exec_podman(&["network", "exists", &self.network]).await?;
        if exists.status.success() {
            return Ok(());
        }

        info!("Creating network: {}", self.network);
        let output = self
            .exec_podman(&["network", "create", &self.network])
            .await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        // Lost a race with a concurrent create
        if stderr.contains("already exists") {
            Ok(())
        } else {
            Err(CorralError::command_exec("podman network create", stderr))
        }
    }

    /// Pull an image
    async fn pull(&self, image: &str) -> CorralResult<()> {
        info!("Pulling image: {}", image);

        let output = self.exec_podman(&["pull", image]).await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(CorralError::ImagePull {
                image: image.to_string(),
                reason: stderr.to_string(),
            })
        }
    }

    /// Check if image exists locally
    async fn image_exists(&self, image: &str) -> CorralResult<bool> {
        let output = self.exec_podman(&["image", "exists", image]).await?;
        Ok(output.status.success())
    }

    /// Build the `podman run` argument list for a spec
    fn run_args(image: &str, spec: &ExecSpec) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];

        args.push("--label".to_string());
        args.push(SERVICE_LABEL.to_string());

        if !spec.hostname.is_empty() {
            args.push("--hostname".to_string());
            args.push(spec.hostname.clone());
        }

        if let Some(workdir) = &spec.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }

        if !spec.network.is_empty() {
            args.push("--network".to_string());
            args.push(spec.network.clone());
            if !spec.hostname.is_empty() && Self::is_named_network(&spec.network) {
                args.push("--network-alias".to_string());
                args.push(spec.hostname.clone());
            }
        }

        for v in &spec.volumes {
            args.push("-v".to_string());
            args.push(v.clone());
        }

        for cache in &spec.caches {
            args.push("-v".to_string());
            args.push(format!("{}:{}", cache.volume.volume_name(), cache.target));
        }

        for (k, v) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", k, v));
        }

        args.push(image.to_string());
        args.extend(spec.args.iter().cloned());
        args
    }

    /// Build the `podman run` argument list for one dial of `port` from
    /// inside `container_id`'s network namespace
    fn dial_args(
        dial_image: &str,
        container_id: &str,
        port: &Port,
        timeout: Duration,
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--network".to_string(),
            format!("container:{}", container_id),
            dial_image.to_string(),
            "nc".to_string(),
            "-z".to_string(),
        ];
        if port.protocol == NetworkProtocol::Udp {
            args.push("-u".to_string());
        }
        args.push("-w".to_string());
        args.push(timeout.as_secs().max(1).to_string());
        args.push("127.0.0.1".to_string());
        args.push(port.port.to_string());
        args
    }

    /// Follow a container's output with `podman logs -f`
    fn follow_logs(container_id: &str) -> (Option<OutputStream>, Option<OutputStream>) {
        let child = Command::new("podman")
            .args(["logs", "-f", container_id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        match child {
            Ok(mut child) => {
                let stdout = child.stdout.take().map(|s| Box::new(s) as OutputStream);
                let stderr = child.stderr.take().map(|s| Box::new(s) as OutputStream);
                // Exits on its own once the container is gone
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                (stdout, stderr)
            }
            Err(e) => {
                warn!("Failed to follow logs for {}: {}", container_id, e);
                (None, None)
            }
        }
    }

    /// Report the container's exit code once `podman wait` returns
    fn watch_exit(container_id: String) -> oneshot::Receiver<ProcessExit> {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let output = Command::new("podman")
                .args(["wait", &container_id])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .output()
                .await;

            let code = output
                .ok()
                .and_then(|o| String::from_utf8_lossy(&o.stdout).trim().parse::<i32>().ok());
            let _ = tx.send(ProcessExit { code });
        });
        rx
    }
}

impl Default for NativePodmanRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for NativePodmanRuntime {
    async fn is_available(&self) -> CorralResult<bool> {
        if !Self::podman_installed().await {
            return Ok(false);
        }
        Self::rootless_configured().await
    }

    async fn ensure_ready(&self) -> CorralResult<()> {
        if !Self::podman_installed().await {
            return Err(CorralError::PodmanNotFound);
        }

        if !Self::rootless_configured().await? {
            return Err(CorralError::PodmanRootlessSetup {
                reason: "Rootless Podman not configured. Run: podman system migrate".to_string(),
            });
        }

        self.ensure_network().await?;

        if !self.image_exists(&self.dial_image).await? {
            self.pull(&self.dial_image).await?;
        }

        Ok(())
    }

    async fn start(&self, spec: &ExecSpec) -> CorralResult<StartedProcess> {
        let image = spec
            .image
            .as_deref()
            .ok_or_else(|| CorralError::ContainerStart("no image specified".to_string()))?;

        // Ensure image is available
        if !self.image_exists(image).await? {
            self.pull(image).await?;
        }

        let args = Self::run_args(image, spec);
        debug!("Running container: podman {:?}", args);

        let args_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.exec_podman(&args_refs).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CorralError::ContainerStart(stderr.to_string()));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let handle = ProcessHandle {
            id: container_id.clone(),
            pid: None,
        };
        info!("Container started: {}", handle.short_id());

        let (stdout, stderr) = Self::follow_logs(&container_id);
        let exited = Self::watch_exit(container_id);

        Ok(StartedProcess {
            handle,
            stdout,
            stderr,
            exited,
        })
    }

    async fn signal(&self, handle: &ProcessHandle, signal: Signal) -> CorralResult<()> {
        debug!("Signaling container {} with {}", handle, signal.name());

        let output = self
            .exec_podman(&["kill", "--signal", signal.name(), &handle.id])
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Already exited
            if stderr.contains("not running") || stderr.contains("no such container") {
                Ok(())
            } else {
                Err(CorralError::command_exec("podman kill", stderr))
            }
        }
    }

    async fn release(&self, handle: &ProcessHandle) -> CorralResult<()> {
        debug!("Removing container: {}", handle);

        let output = self.exec_podman(&["rm", "-f", &handle.id]).await?;

        if output.status.success() {
            Ok(())
        } else {
            // Ignore error if container doesn't exist
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no such container") {
                Ok(())
            } else {
                Err(CorralError::command_exec("podman rm", stderr))
            }
        }
    }

    async fn exec(&self, handle: &ProcessHandle, args: &[String]) -> CorralResult<i32> {
        let mut podman_args = vec!["exec", handle.id.as_str()];
        podman_args.extend(args.iter().map(String::as_str));

        let output = self.exec_podman(&podman_args).await?;
        Ok(output.status.code().unwrap_or(-1))
    }

    async fn dial(
        &self,
        handle: &ProcessHandle,
        port: &Port,
        timeout: Duration,
    ) -> CorralResult<()> {
        let args = Self::dial_args(&self.dial_image, &handle.id, port, timeout);
        let args_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let target = format!("{}:{}", handle.short_id(), port);

        let output = match tokio::time::timeout(
            timeout + DIAL_STARTUP_ALLOWANCE,
            self.exec_podman(&args_refs),
        )
        .await
        {
            Ok(output) => output?,
            Err(_) => {
                return Err(CorralError::PortNotReady {
                    target,
                    reason: "dial container did not finish".to_string(),
                })
            }
        };

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(CorralError::PortNotReady {
            target,
            reason: if stderr.is_empty() {
                format!("nc exited with {}", output.status)
            } else {
                stderr
            },
        })
    }

    async fn network_address(&self, handle: &ProcessHandle) -> CorralResult<String> {
        let output = self
            .exec_podman(&[
                "inspect",
                "--format",
                "{{.NetworkSettings.IPAddress}}{{range .NetworkSettings.Networks}} {{.IPAddress}}{{end}}",
                &handle.id,
            ])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CorralError::command_exec("podman inspect", stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match stdout.split_whitespace().next() {
            Some(ip) => Ok(ip.to_string()),
            None => Err(CorralError::command_exec(
                "podman inspect",
                format!("container {} has no network address", handle),
            )),
        }
    }

    fn runtime_name(&self) -> &'static str {
        "Native Podman"
    }
}
