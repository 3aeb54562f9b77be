//! Stack files
//!
//! A stack is a TOML file of named services:
//!
//! ```toml
//! [services.db]
//! image = "postgres:16"
//! env = { POSTGRES_PASSWORD = "secret" }
//! ports = [{ port = 5432 }]
//!
//! [services.api]
//! image = "ghcr.io/acme/api:latest"
//! ports = [{ port = 8080 }]
//! depends_on = ["db"]
//! ```
//!
//! Each table name is the service's primary alias. `depends_on` entries are
//! started before the dependent and reachable from it under their own names.

use crate::error::{CorralError, CorralResult};
use crate::service::{ServiceBinding, ServiceBindings, ServiceSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

/// One `[services.<alias>]` table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackService {
    #[serde(flatten)]
    pub spec: ServiceSpec,

    /// Extra aliases besides the table name
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Services this one needs running first
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A parsed stack file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stack {
    #[serde(default)]
    pub services: BTreeMap<String, StackService>,

    #[serde(skip)]
    path: PathBuf,
}

impl Stack {
    /// Read and validate a stack file
    pub async fn load(path: &Path) -> CorralResult<Self> {
        if !path.exists() {
            return Err(CorralError::PathNotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| CorralError::io(format!("reading stack {}", path.display()), e))?;
        Self::parse(&content, path)
    }

    /// Parse stack file content; `path` is only used in error messages
    pub fn parse(content: &str, path: &Path) -> CorralResult<Self> {
        let mut stack: Stack = toml::from_str(content).map_err(|e| CorralError::StackInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        stack.path = path.to_path_buf();
        stack.validate()?;
        Ok(stack)
    }

    fn invalid(&self, reason: impl Into<String>) -> CorralError {
        CorralError::StackInvalid {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn validate(&self) -> CorralResult<()> {
        if self.services.is_empty() {
            return Err(self.invalid("no services defined"));
        }
        for (name, service) in &self.services {
            if service.spec.image.is_none() && service.spec.args.is_empty() {
                return Err(self.invalid(format!("service '{}' has neither image nor args", name)));
            }
            if let Some(missing) = service
                .depends_on
                .iter()
                .find(|dep| !self.services.contains_key(dep.as_str()))
            {
                return Err(self.invalid(format!(
                    "service '{}' depends on unknown service '{}'",
                    name, missing
                )));
            }
        }
        Ok(())
    }

    /// Bindings for every service in the stack, dependencies resolved
    pub fn bindings(&self) -> CorralResult<ServiceBindings> {
        let mut resolved = HashMap::new();
        let mut bindings = ServiceBindings::new();
        for name in self.services.keys() {
            let spec = self.resolve(name, &mut resolved, &mut Vec::new())?;
            bindings.push(self.binding(name, spec)?);
        }
        Ok(bindings)
    }

    fn resolve(
        &self,
        name: &str,
        resolved: &mut HashMap<String, Arc<ServiceSpec>>,
        visiting: &mut Vec<String>,
    ) -> CorralResult<Arc<ServiceSpec>> {
        if let Some(spec) = resolved.get(name) {
            return Ok(spec.clone());
        }
        if visiting.iter().any(|v| v == name) {
            visiting.push(name.to_string());
            return Err(self.invalid(format!("dependency cycle: {}", visiting.join(" -> "))));
        }
        let service = self
            .services
            .get(name)
            .ok_or_else(|| self.invalid(format!("unknown service '{}'", name)))?;

        visiting.push(name.to_string());
        let mut spec = service.spec.clone();
        for dep in &service.depends_on {
            let dep_spec = self.resolve(dep, resolved, visiting)?;
            spec.dependencies.push(self.binding(dep, dep_spec)?);
        }
        visiting.pop();

        let spec = spec.shared();
        resolved.insert(name.to_string(), spec.clone());
        Ok(spec)
    }

    fn binding(&self, name: &str, spec: Arc<ServiceSpec>) -> CorralResult<ServiceBinding> {
        let mut binding = ServiceBinding::new(spec)?.with_alias(name);
        if let Some(service) = self.services.get(name) {
            for alias in &service.aliases {
                binding = binding.with_alias(alias.as_str());
            }
        }
        Ok(binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK: &str = r#"
        [services.db]
        image = "postgres:16"
        aliases = ["postgres"]
        ports = [{ port = 5432 }]

        [services.db.env]
        POSTGRES_PASSWORD = "secret"

        [services.api]
        image = "acme/api"
        args = ["serve", "--port", "8080"]
        ports = [{ port = 8080 }]
        depends_on = ["db"]
    "#;

    fn parse(content: &str) -> CorralResult<Stack> {
        Stack::parse(content, Path::new("corral.toml"))
    }

    #[test]
    fn parses_flattened_service_fields() {
        let stack = parse(STACK).unwrap();
        let db = &stack.services["db"];
        assert_eq!(db.spec.image.as_deref(), Some("postgres:16"));
        assert_eq!(db.spec.env["POSTGRES_PASSWORD"], "secret");
        assert_eq!(db.spec.ports[0].port, 5432);
        assert_eq!(db.aliases, vec!["postgres"]);
        assert_eq!(stack.services["api"].depends_on, vec!["db"]);
    }

    #[test]
    fn bindings_resolve_dependencies() {
        let stack = parse(STACK).unwrap();
        let bindings = stack.bindings().unwrap();
        assert_eq!(bindings.len(), 2);

        let api = bindings
            .iter()
            .find(|b| b.aliases.iter().any(|a| a == "api"))
            .unwrap();
        let db = bindings
            .iter()
            .find(|b| b.aliases.iter().any(|a| a == "db"))
            .unwrap();
        assert_eq!(db.aliases.iter().collect::<Vec<_>>(), vec!["db", "postgres"]);

        let dep = api.service.dependencies.iter().next().unwrap();
        assert_eq!(dep.hostname, db.hostname);
    }

    #[test]
    fn dependency_changes_hostname() {
        let without = parse(
            r#"
            [services.api]
            image = "acme/api"
            "#,
        )
        .unwrap();
        let with = parse(STACK).unwrap();

        let host = |stack: &Stack| {
            stack
                .bindings()
                .unwrap()
                .iter()
                .find(|b| b.aliases.iter().any(|a| a == "api"))
                .map(|b| b.hostname.clone())
                .unwrap()
        };
        assert_ne!(host(&without), host(&with));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = parse(
            r#"
            [services.api]
            image = "acme/api"
            depends_on = ["cache"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown service 'cache'"));
    }

    #[test]
    fn rejects_cycles() {
        let stack = parse(
            r#"
            [services.a]
            image = "a"
            depends_on = ["b"]

            [services.b]
            image = "b"
            depends_on = ["a"]
            "#,
        )
        .unwrap();
        let err = stack.bindings().unwrap_err();
        assert!(err.to_string().contains("dependency cycle"));
    }

    #[test]
    fn rejects_empty_service() {
        let err = parse("[services.empty]\n").unwrap_err();
        assert!(matches!(err, CorralError::StackInvalid { .. }));
        assert!(parse("").is_err());
    }

    #[tokio::test]
    async fn load_missing_file() {
        let err = Stack::load(Path::new("/nonexistent/corral.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, CorralError::PathNotFound(_)));
    }
}
