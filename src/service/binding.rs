//! Service bindings
//!
//! A [`ServiceBinding`] declares a service a resource needs and the aliases
//! it should be reachable under. A live [`Binding`] keeps a set of started
//! services attached until it is released or dropped.

use crate::digest::{DigestWriter, Digestible};
use crate::error::CorralResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::registry::ServiceRegistry;
use super::{ServiceHandle, ServiceSpec};

/// Prefix of the environment variables mapping aliases to hostnames
pub const ALIAS_ENV_PREFIX: &str = "CORRAL_HOSTNAME_ALIAS_";

/// Ordered set of alias names
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AliasSet(Vec<String>);

impl AliasSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy with `alias` added, if not already present
    pub fn with(&self, alias: impl Into<String>) -> Self {
        let alias = alias.into();
        let mut set = self.clone();
        if !set.0.contains(&alias) {
            set.0.push(alias);
        }
        set
    }

    /// Return the union, keeping this set's order first
    pub fn union(&self, other: &AliasSet) -> Self {
        other.0.iter().fold(self.clone(), |set, alias| set.with(alias.as_str()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for AliasSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("no aliases")
        } else {
            write!(f, "aliased as {}", self.0.join(", "))
        }
    }
}

impl<S: Into<String>> FromIterator<S> for AliasSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        iter.into_iter()
            .fold(AliasSet::new(), |set, alias| set.with(alias))
    }
}

/// A service a resource depends on
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceBinding {
    pub service: Arc<ServiceSpec>,
    /// Content-derived short hostname of `service`
    pub hostname: String,
    pub aliases: AliasSet,
}

impl ServiceBinding {
    /// Bind a service with no aliases
    pub fn new(service: Arc<ServiceSpec>) -> CorralResult<Self> {
        let hostname = service.hostname()?;
        Ok(Self {
            service,
            hostname,
            aliases: AliasSet::new(),
        })
    }

    /// Add an alias
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases = self.aliases.with(alias);
        self
    }
}

impl Digestible for ServiceBinding {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.field("hostname", &self.hostname)?;
        w.field("aliases", &self.aliases.0)
    }
}

/// The service dependencies of one resource
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServiceBindings(Vec<ServiceBinding>);

impl ServiceBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding, merging aliases if its hostname is already bound
    pub fn push(&mut self, binding: ServiceBinding) {
        match self.0.iter_mut().find(|b| b.hostname == binding.hostname) {
            Some(existing) => existing.aliases = existing.aliases.union(&binding.aliases),
            None => self.0.push(binding),
        }
    }

    /// Union of two binding lists; aliases of shared hostnames are merged
    pub fn merge(&self, other: &ServiceBindings) -> Self {
        let mut merged = self.clone();
        for binding in &other.0 {
            merged.push(binding.clone());
        }
        merged
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceBinding> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ServiceBinding> for ServiceBindings {
    fn from_iter<I: IntoIterator<Item = ServiceBinding>>(iter: I) -> Self {
        let mut bindings = ServiceBindings::new();
        for binding in iter {
            bindings.push(binding);
        }
        bindings
    }
}

impl Digestible for ServiceBindings {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.sequence(&self.0)
    }
}

/// Environment variables mapping each alias to its service's full hostname
pub fn alias_env<'a, I>(bound: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a ServiceBinding, &'a ServiceHandle)>,
{
    let mut env = BTreeMap::new();
    for (binding, handle) in bound {
        for alias in binding.aliases.iter() {
            env.insert(format!("{}{}", ALIAS_ENV_PREFIX, alias), handle.full_hostname());
        }
    }
    env
}

/// Started services held attached for the lifetime of this value
///
/// Dropping the binding detaches every service, as does [`Binding::release`].
pub struct Binding {
    registry: ServiceRegistry,
    services: Vec<(ServiceBinding, ServiceHandle)>,
}

impl Binding {
    pub(crate) fn new(
        registry: ServiceRegistry,
        services: Vec<(ServiceBinding, ServiceHandle)>,
    ) -> Self {
        Self { registry, services }
    }

    /// Handles of the bound services, in binding order
    pub fn handles(&self) -> impl Iterator<Item = &ServiceHandle> {
        self.services.iter().map(|(_, handle)| handle)
    }

    /// Bound services with the bindings they were started for
    pub fn bound(&self) -> &[(ServiceBinding, ServiceHandle)] {
        &self.services
    }

    /// Handle of the service bound under `alias`
    pub fn by_alias(&self, alias: &str) -> Option<&ServiceHandle> {
        self.services
            .iter()
            .find(|(binding, _)| binding.aliases.iter().any(|a| a == alias))
            .map(|(_, handle)| handle)
    }

    /// Alias environment for a resource using these services
    pub fn env(&self) -> BTreeMap<String, String> {
        alias_env(self.services.iter().map(|(b, h)| (b, h)))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Detach every bound service now
    pub fn release(mut self) {
        self.detach_all();
    }

    fn detach_all(&mut self) {
        for (_, handle) in self.services.drain(..) {
            debug!("Releasing binding on {}", handle.identity());
            self.registry.detach_logged(&handle);
        }
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.detach_all();
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("services", &self.services.len())
            .finish()
    }
}
