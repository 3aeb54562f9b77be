//! Service identities and the handles callers receive

use crate::error::{CorralError, CorralResult};
use crate::orchestration::ProcessHandle;
use crate::service::Port;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// A client session that owns services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a fresh client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// DNS domain under which this client's services are reachable
    pub fn domain(&self) -> String {
        let sum = Sha256::digest(self.0.as_bytes());
        format!("c{}", &hex::encode(sum)[..12])
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key under which a service instance is deduplicated
///
/// The owning client is part of the key, so equal hostnames from different
/// clients are always separate instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceIdentity {
    pub hostname: String,
    pub client: ClientId,
}

impl ServiceIdentity {
    /// Create an identity, rejecting empty hostnames
    pub fn new(hostname: impl Into<String>, client: ClientId) -> CorralResult<Self> {
        let hostname = hostname.into();
        if hostname.is_empty() {
            return Err(CorralError::HostnameMissing);
        }
        Ok(Self { hostname, client })
    }

    /// Hostname qualified with the client domain
    pub fn full_hostname(&self) -> String {
        format!("{}.{}", self.hostname, self.client.domain())
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_hostname())
    }
}

/// A caller's reference to a running service
///
/// Handles are cheap to clone and carry the generation of the instance they
/// were issued for; a handle outliving its instance never affects a later one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub(crate) identity: ServiceIdentity,
    pub(crate) process: ProcessHandle,
    pub(crate) ports: Vec<Port>,
    pub(crate) generation: u64,
}

impl ServiceHandle {
    /// Identity this handle was issued for
    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    /// Short hostname
    pub fn hostname(&self) -> &str {
        &self.identity.hostname
    }

    /// Hostname qualified with the client domain
    pub fn full_hostname(&self) -> String {
        self.identity.full_hostname()
    }

    /// Underlying process or container
    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    /// Ports the service exposes
    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    /// Instance generation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Address of one of the service's ports
    ///
    /// Port 0 selects the first exposed port. An empty scheme yields a bare
    /// `host:port`.
    pub fn endpoint(&self, port: u16, scheme: &str) -> CorralResult<String> {
        let port = if port == 0 {
            self.ports
                .first()
                .map(|p| p.port)
                .ok_or_else(|| CorralError::NoPortsExposed(self.identity.hostname.clone()))?
        } else {
            port
        };

        let host = self.full_hostname();
        if scheme.is_empty() {
            Ok(format!("{}:{}", host, port))
        } else {
            Ok(format!("{}://{}:{}", scheme, host, port))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(ports: Vec<Port>) -> ServiceHandle {
        ServiceHandle {
            identity: ServiceIdentity::new("habc", ClientId::new()).unwrap(),
            process: ProcessHandle {
                id: "mock-0001".to_string(),
                pid: None,
            },
            ports,
            generation: 1,
        }
    }

    #[test]
    fn client_domain_is_stable_per_client() {
        let client = ClientId::new();
        assert_eq!(client.domain(), client.domain());
        assert_eq!(client.domain().len(), 13);
        assert_ne!(client.domain(), ClientId::new().domain());
    }

    #[test]
    fn identity_scopes_by_client() {
        let a = ServiceIdentity::new("hdb", ClientId::new()).unwrap();
        let b = ServiceIdentity::new("hdb", ClientId::new()).unwrap();
        assert_ne!(a, b);
        assert_ne!(a.full_hostname(), b.full_hostname());
        assert!(a.full_hostname().starts_with("hdb.c"));
    }

    #[test]
    fn empty_hostname_rejected() {
        assert!(matches!(
            ServiceIdentity::new("", ClientId::new()),
            Err(CorralError::HostnameMissing)
        ));
    }

    #[test]
    fn endpoint_formats() {
        let h = handle(vec![Port::tcp(5432), Port::tcp(8080)]);
        let host = h.full_hostname();
        assert_eq!(h.endpoint(0, "").unwrap(), format!("{}:5432", host));
        assert_eq!(
            h.endpoint(8080, "http").unwrap(),
            format!("http://{}:8080", host)
        );
    }

    #[test]
    fn endpoint_without_ports() {
        let h = handle(vec![]);
        assert!(matches!(
            h.endpoint(0, "tcp"),
            Err(CorralError::NoPortsExposed(_))
        ));
        // An explicit port does not need a declared one
        assert!(h.endpoint(9000, "tcp").is_ok());
    }
}
