//! Command readiness probe
//!
//! Docker-style health checks: `["CMD", "pg_isready"]` runs the arguments
//! as-is, `["CMD-SHELL", "curl -f localhost"]` runs them through `/bin/sh -c`.

use super::HealthSettings;
use crate::digest::{DigestWriter, Digestible};
use crate::error::{CorralError, CorralResult};
use crate::orchestration::{ProcessHandle, Runtime};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Health check command declared by a service
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthcheckConfig {
    /// `CMD` or `CMD-SHELL` followed by the command
    pub test: Vec<String>,
    /// Delay between attempts in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    /// Total deadline in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl HealthcheckConfig {
    /// Shorthand for a `CMD` check
    pub fn cmd<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut test = vec!["CMD".to_string()];
        test.extend(args.into_iter().map(Into::into));
        Self {
            test,
            ..Self::default()
        }
    }

    /// Shorthand for a `CMD-SHELL` check
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            test: vec!["CMD-SHELL".to_string(), script.into()],
            ..Self::default()
        }
    }

    /// Resolve the argument vector to execute
    pub fn command_args(&self) -> CorralResult<Vec<String>> {
        match self.test.split_first() {
            Some((kind, rest)) if kind == "CMD" && !rest.is_empty() => Ok(rest.to_vec()),
            Some((kind, rest)) if kind == "CMD-SHELL" && !rest.is_empty() => Ok(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                rest.join(" "),
            ]),
            _ => Err(CorralError::HealthCheckUnsupported(self.test.join(" "))),
        }
    }

    /// Interval, falling back to the configured default
    pub fn interval(&self, settings: &HealthSettings) -> Duration {
        self.interval_ms
            .map(Duration::from_millis)
            .unwrap_or(settings.command_interval)
    }

    /// Deadline, falling back to the configured default
    pub fn timeout(&self, settings: &HealthSettings) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(settings.command_timeout)
    }
}

impl Digestible for HealthcheckConfig {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.field("test", &self.test)?;
        w.field("interval_ms", &self.interval_ms)?;
        w.field("timeout_ms", &self.timeout_ms)
    }
}

/// Run the health check command until it exits zero or the deadline passes
pub async fn wait_for_command(
    runtime: &dyn Runtime,
    handle: &ProcessHandle,
    config: &HealthcheckConfig,
    settings: &HealthSettings,
    cancel: &CancellationToken,
) -> CorralResult<()> {
    let args = config.command_args()?;
    let interval = config.interval(settings);
    let deadline = config.timeout(settings);
    let started = Instant::now();

    let attempts = async {
        loop {
            match runtime.exec(handle, &args).await {
                Ok(0) => return Ok(()),
                Ok(code) => debug!("Health check command exited {}", code),
                Err(e) => debug!("Health check command failed: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(CorralError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    };

    match tokio::time::timeout(deadline, attempts).await {
        Ok(Ok(())) => {
            info!(command = %args.join(" "), "health check passed");
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(CorralError::HealthCheckTimeout {
            probe: format!("command {:?}", args.join(" ")),
            waited: started.elapsed(),
        }),
    }
}
