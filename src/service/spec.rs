//! Service definitions
//!
//! A service's hostname is derived from the digest of its spec, so two
//! callers asking for identical services share one instance.

use crate::digest::{digest, DigestWriter, Digestible};
use crate::error::CorralResult;
use crate::health::{HealthcheckConfig, Probe};
use crate::orchestration::{CacheMount, ExecSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::binding::ServiceBindings;

/// Transport protocol of an exposed port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkProtocol {
    #[default]
    Tcp,
    Udp,
}

impl NetworkProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkProtocol::Tcp => "tcp",
            NetworkProtocol::Udp => "udp",
        }
    }
}

impl fmt::Display for NetworkProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A port a service listens on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub port: u16,
    #[serde(default)]
    pub protocol: NetworkProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Exclude this port from the readiness probe
    #[serde(default)]
    pub skip_health_check: bool,
}

impl Port {
    /// A health-checked TCP port
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: NetworkProtocol::Tcp,
            description: None,
            skip_health_check: false,
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

impl Digestible for Port {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.field("port", &self.port)?;
        w.field("protocol", self.protocol.as_str())?;
        w.field("description", &self.description)?;
        w.field("skip_health_check", &self.skip_health_check)
    }
}

/// Everything needed to run one long-lived service
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSpec {
    pub image: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub ports: Vec<Port>,
    pub healthcheck: Option<HealthcheckConfig>,
    pub caches: Vec<CacheMount>,
    /// Services started before this one and detached after it stops
    #[serde(skip)]
    pub dependencies: ServiceBindings,
}

impl ServiceSpec {
    /// Create a spec running `args` in `image`
    pub fn new<I, S>(image: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            image: Some(image.into()),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Add an exposed port
    pub fn with_port(mut self, port: Port) -> Self {
        self.ports.push(port);
        self
    }

    /// Short hostname derived from the spec's content
    pub fn hostname(&self) -> CorralResult<String> {
        Ok(digest(self)?.host_hash())
    }

    /// Readiness probe for this service
    ///
    /// A declared health check command wins over port probing.
    pub fn probe(&self) -> Probe {
        match &self.healthcheck {
            Some(config) => Probe::Command(config.clone()),
            None => Probe::Ports(self.ports.clone()),
        }
    }

    /// Resolve into the runtime's execution spec
    pub fn exec_spec(
        &self,
        full_hostname: String,
        network: &str,
        extra_env: BTreeMap<String, String>,
    ) -> ExecSpec {
        let mut env = self.env.clone();
        env.extend(extra_env);
        ExecSpec {
            image: self.image.clone(),
            args: self.args.clone(),
            env,
            workdir: self.workdir.clone(),
            hostname: full_hostname,
            network: network.to_string(),
            volumes: Vec::new(),
            caches: self.caches.clone(),
        }
    }

    /// Wrap for sharing between bindings
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl Digestible for ServiceSpec {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.field("image", &self.image)?;
        w.field("args", &self.args)?;
        w.field("env", &self.env)?;
        w.field("workdir", &self.workdir)?;
        w.field("ports", &self.ports)?;
        w.field("healthcheck", &self.healthcheck)?;
        w.field("caches", &self.caches)?;
        w.field("dependencies", &self.dependencies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheVolume;

    #[test]
    fn hostname_is_content_derived() {
        let a = ServiceSpec::new("redis:7", ["redis-server"]).with_port(Port::tcp(6379));
        let b = ServiceSpec::new("redis:7", ["redis-server"]).with_port(Port::tcp(6379));
        let c = ServiceSpec::new("redis:7", ["redis-server"]).with_port(Port::tcp(6380));

        assert_eq!(a.hostname().unwrap(), b.hostname().unwrap());
        assert_ne!(a.hostname().unwrap(), c.hostname().unwrap());
        assert_eq!(a.hostname().unwrap().len(), 13);
    }

    #[test]
    fn env_order_does_not_change_hostname() {
        let mut a = ServiceSpec::new("app", ["serve"]);
        a.env.insert("A".to_string(), "1".to_string());
        a.env.insert("B".to_string(), "2".to_string());
        let mut b = ServiceSpec::new("app", ["serve"]);
        b.env.insert("B".to_string(), "2".to_string());
        b.env.insert("A".to_string(), "1".to_string());
        assert_eq!(a.hostname().unwrap(), b.hostname().unwrap());
    }

    #[test]
    fn probe_prefers_healthcheck() {
        let spec = ServiceSpec::new("pg", ["postgres"]).with_port(Port::tcp(5432));
        assert!(matches!(spec.probe(), Probe::Ports(ref p) if p.len() == 1));

        let spec = ServiceSpec {
            healthcheck: Some(HealthcheckConfig::cmd(["pg_isready"])),
            ..spec
        };
        assert!(matches!(spec.probe(), Probe::Command(_)));
    }

    #[test]
    fn exec_spec_merges_env() {
        let mut spec = ServiceSpec::new("app", ["serve"]);
        spec.env.insert("MODE".to_string(), "dev".to_string());
        spec.caches.push(CacheMount {
            target: "/cache".to_string(),
            volume: CacheVolume::new(["app"]),
        });

        let mut extra = BTreeMap::new();
        extra.insert("CORRAL_HOSTNAME_ALIAS_db".to_string(), "hdb.c1".to_string());
        let exec = spec.exec_spec("happ.c1".to_string(), "bridge", extra);

        assert_eq!(exec.hostname, "happ.c1");
        assert_eq!(exec.env.len(), 2);
        assert_eq!(exec.caches.len(), 1);
        assert_eq!(exec.network, "bridge");
    }

    #[test]
    fn port_display_and_serde() {
        let port: Port = toml::from_str("port = 53\nprotocol = \"udp\"").unwrap();
        assert_eq!(port.to_string(), "53/udp");
        assert!(!port.skip_health_check);
    }
}
