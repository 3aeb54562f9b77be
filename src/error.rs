//! Error types for Corral
//!
//! All modules use `CorralResult<T>` as their return type.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for Corral operations
pub type CorralResult<T> = Result<T, CorralError>;

/// All errors that can occur in Corral
#[derive(Error, Debug)]
pub enum CorralError {
    // Runtime errors
    #[error("Podman not found. Install it from https://podman.io")]
    PodmanNotFound,

    #[error("Podman rootless setup incomplete: {reason}")]
    PodmanRootlessSetup { reason: String },

    #[error("Unsupported runtime backend: {0}. Valid backends: podman, process")]
    UnsupportedBackend(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Invalid stack file {path}: {reason}")]
    StackInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Digest errors
    #[error("Cannot digest {shape}: {reason}")]
    DigestUnsupported { shape: String, reason: String },

    #[error("Invalid content digest: {0}")]
    DigestInvalid(String),

    // Cache errors
    #[error("compute {key}: {source}")]
    Compute {
        key: String,
        #[source]
        source: Arc<CorralError>,
    },

    // Service errors
    #[error("Service hostname not set")]
    HostnameMissing,

    #[error("start {hostname} ({aliases}): {source}")]
    ServiceStart {
        hostname: String,
        aliases: String,
        #[source]
        source: Box<CorralError>,
    },

    #[error("{phase} {service}: {source}")]
    ServiceLaunch {
        service: String,
        /// Step of the start attempt that failed
        phase: &'static str,
        #[source]
        source: Box<CorralError>,
    },

    #[error("Service exited before health check (exit code: {code}){output}")]
    ServiceExited { code: String, output: String },

    #[error("No ports exposed by service {0}")]
    NoPortsExposed(String),

    // Health check errors
    #[error("Health check for {probe} timed out after {waited:?}")]
    HealthCheckTimeout { probe: String, waited: Duration },

    #[error("Port {target} not ready: {reason}")]
    PortNotReady { target: String, reason: String },

    #[error("Unsupported health check command: {0:?}")]
    HealthCheckUnsupported(String),

    #[error("Operation cancelled")]
    Cancelled,

    // Container errors
    #[error("Container failed to start: {0}")]
    ContainerStart(String),

    #[error("Command exited with code {code}: {command}")]
    CommandExit { command: String, code: i32 },

    #[error("Image pull failed: {image}: {reason}")]
    ImagePull { image: String, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    #[error("Process terminated by signal")]
    ProcessSignaled,

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl CorralError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Check if error is retryable
    ///
    /// Start and health failures are time-dependent; a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ContainerStart(_)
            | Self::ServiceExited { .. }
            | Self::HealthCheckTimeout { .. } => true,
            Self::ServiceStart { source, .. } | Self::ServiceLaunch { source, .. } => {
                source.is_retryable()
            }
            Self::Compute { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Whether this error is (or wraps) a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::ServiceStart { source, .. } | Self::ServiceLaunch { source, .. } => {
                source.is_cancelled()
            }
            Self::Compute { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Innermost error beneath any service or compute wrappers
    pub fn root_cause(&self) -> &CorralError {
        match self {
            Self::ServiceStart { source, .. } | Self::ServiceLaunch { source, .. } => {
                source.root_cause()
            }
            Self::Compute { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::PodmanNotFound => Some("Install Podman, or set runtime.backend = \"process\""),
            Self::PodmanRootlessSetup { .. } => Some("Run: podman system migrate"),
            Self::UnsupportedBackend(_) => Some("Run: corral config show"),
            Self::StackInvalid { .. } => Some("Each [services.<alias>] table needs an image or args"),
            _ => None,
        }
    }
}
