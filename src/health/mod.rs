//! Readiness probes for started services
//!
//! A start attempt is only reported successful once its probe passes:
//! - Port probe: dial every declared port with exponential backoff
//! - Command probe: run the declared health check until it exits zero
//!
//! Both probes run through the runtime, inside the resource's own network
//! namespace or execution context, never the host's.

mod backoff;
mod command;
mod port;

pub use backoff::ExponentialBackoff;
pub use command::{wait_for_command, HealthcheckConfig};
pub use port::wait_for_port;

use crate::config::schema::HealthConfig;
use crate::error::{CorralError, CorralResult};
use crate::orchestration::{ProcessHandle, Runtime};
use crate::service::Port;
use futures_util::future::try_join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Timing parameters for both probe kinds
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSettings {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Per-dial connect timeout
    pub dial_timeout: Duration,
    /// Total deadline for a port probe; `None` waits until cancelled
    pub port_deadline: Option<Duration>,
    pub command_timeout: Duration,
    pub command_interval: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

impl From<&HealthConfig> for HealthSettings {
    fn from(config: &HealthConfig) -> Self {
        Self {
            initial_interval: Duration::from_millis(config.initial_interval_ms),
            max_interval: Duration::from_millis(config.max_interval_ms),
            multiplier: config.multiplier,
            dial_timeout: Duration::from_millis(config.dial_timeout_ms),
            port_deadline: match config.port_deadline_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            command_interval: Duration::from_millis(config.command_interval_ms),
        }
    }
}

/// What to check before declaring a service ready
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    /// Dial each port not flagged `skip_health_check`
    Ports(Vec<Port>),
    /// Run a health check command inside the resource
    Command(HealthcheckConfig),
}

impl Probe {
    /// Human-readable probe description for errors
    pub fn describe(&self) -> String {
        match self {
            Probe::Ports(ports) => {
                let checked: Vec<String> = ports
                    .iter()
                    .filter(|p| !p.skip_health_check)
                    .map(|p| p.to_string())
                    .collect();
                if checked.is_empty() {
                    "no ports".to_string()
                } else {
                    format!("ports {}", checked.join(", "))
                }
            }
            Probe::Command(config) => format!("command {:?}", config.test.join(" ")),
        }
    }
}

/// Runs readiness probes against resources started by a runtime
#[derive(Clone)]
pub struct HealthChecker {
    runtime: Arc<dyn Runtime>,
    settings: HealthSettings,
}

impl HealthChecker {
    /// Create a checker probing resources of `runtime`
    pub fn new(runtime: Arc<dyn Runtime>, settings: HealthSettings) -> Self {
        Self { runtime, settings }
    }

    /// Timing parameters in effect
    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Block until `probe` passes for `handle`, the deadline passes, or `cancel` fires
    pub async fn check(
        &self,
        handle: &ProcessHandle,
        probe: &Probe,
        cancel: &CancellationToken,
    ) -> CorralResult<()> {
        match probe {
            Probe::Ports(ports) => self.check_ports(handle, ports, probe, cancel).await,
            Probe::Command(config) => {
                wait_for_command(
                    self.runtime.as_ref(),
                    handle,
                    config,
                    &self.settings,
                    cancel,
                )
                .await
            }
        }
    }

    async fn check_ports(
        &self,
        handle: &ProcessHandle,
        ports: &[Port],
        probe: &Probe,
        cancel: &CancellationToken,
    ) -> CorralResult<()> {
        let checked: Vec<&Port> = ports.iter().filter(|p| !p.skip_health_check).collect();
        if checked.is_empty() {
            debug!("No ports to check for {}", handle);
            return Ok(());
        }

        let runtime = self.runtime.as_ref();
        let dials = try_join_all(
            checked
                .into_iter()
                .map(|port| wait_for_port(runtime, handle, port, &self.settings, cancel)),
        );

        let started = Instant::now();
        match self.settings.port_deadline {
            None => dials.await.map(drop),
            Some(deadline) => match tokio::time::timeout(deadline, dials).await {
                Ok(result) => result.map(drop),
                Err(_) => Err(CorralError::HealthCheckTimeout {
                    probe: probe.describe(),
                    waited: started.elapsed(),
                }),
            },
        }
    }
}
