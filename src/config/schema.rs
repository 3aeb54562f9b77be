//! Configuration schema for Corral
//!
//! Configuration is stored at `~/.config/corral/config.toml`

use serde::{Deserialize, Serialize};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Runtime backend settings
    pub runtime: RuntimeConfig,

    /// Service lifecycle settings
    pub services: ServicesConfig,

    /// Readiness probe settings
    pub health: HealthConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Runtime backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Backend: "podman" or "process"
    pub backend: String,

    /// Podman network for service containers, created with DNS on first use
    pub network: String,

    /// Image whose `nc` dials service ports from inside their network namespace
    pub dial_image: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: "podman".to_string(),
            network: "corral".to_string(),
            dial_image: "docker.io/library/busybox:latest".to_string(),
        }
    }
}

/// Service lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Grace period between the last detach and teardown, in milliseconds
    pub detach_grace_ms: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            detach_grace_ms: 10_000,
        }
    }
}

/// Readiness probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// First delay between port dials
    pub initial_interval_ms: u64,

    /// Longest delay between port dials
    pub max_interval_ms: u64,

    /// Growth factor between port dials
    pub multiplier: f64,

    /// Connect timeout of a single dial
    pub dial_timeout_ms: u64,

    /// Total deadline for port probes; 0 waits until cancelled
    pub port_deadline_secs: u64,

    /// Default deadline for health check commands
    pub command_timeout_secs: u64,

    /// Default delay between health check commands
    pub command_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 100,
            max_interval_ms: 10_000,
            multiplier: 1.5,
            dial_timeout_ms: 1_000,
            port_deadline_secs: 60,
            command_timeout_secs: 30,
            command_interval_ms: 1_000,
        }
    }
}
