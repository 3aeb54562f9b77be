//! Runtime factory for creating the configured runtime backend

use crate::config::schema::RuntimeConfig;
use crate::error::{CorralError, CorralResult};
use crate::orchestration::local_process::HostProcessRuntime;
use crate::orchestration::native_podman::NativePodmanRuntime;
use crate::orchestration::runtime::Runtime;
use std::sync::Arc;

/// Supported runtime backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Rootless Podman containers
    Podman,
    /// Plain host processes
    Process,
}

impl Backend {
    /// Parse a backend name from configuration
    pub fn parse(name: &str) -> CorralResult<Self> {
        match name {
            "podman" => Ok(Backend::Podman),
            "process" => Ok(Backend::Process),
            other => Err(CorralError::UnsupportedBackend(other.to_string())),
        }
    }

    /// Get a human-readable backend name
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Podman => "podman",
            Backend::Process => "process",
        }
    }
}

/// Create the runtime selected by `config.backend`
pub fn create_runtime(config: &RuntimeConfig) -> CorralResult<Arc<dyn Runtime>> {
    match Backend::parse(&config.backend)? {
        Backend::Podman => Ok(Arc::new(NativePodmanRuntime::from_config(config))),
        Backend::Process => Ok(Arc::new(HostProcessRuntime::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parse() {
        assert_eq!(Backend::parse("podman").unwrap(), Backend::Podman);
        assert_eq!(Backend::parse("process").unwrap(), Backend::Process);
        assert!(matches!(
            Backend::parse("docker"),
            Err(CorralError::UnsupportedBackend(_))
        ));
    }

    #[test]
    fn backend_name() {
        assert_eq!(Backend::Podman.name(), "podman");
        assert_eq!(Backend::Process.name(), "process");
    }

    #[test]
    fn create_runtime_by_backend() {
        let mut config = RuntimeConfig::default();
        let runtime = create_runtime(&config).unwrap();
        assert_eq!(runtime.runtime_name(), "Native Podman");

        config.backend = "process".to_string();
        let runtime = create_runtime(&config).unwrap();
        assert_eq!(runtime.runtime_name(), "Host process");

        config.backend = "vm".to_string();
        assert!(create_runtime(&config).is_err());
    }
}
