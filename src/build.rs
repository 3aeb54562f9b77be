//! Materializing operation graphs through the keyed cache
//!
//! The build backend that actually evaluates a graph is external; this
//! module only guarantees that identical graphs are evaluated once and that
//! services they depend on are attached for the duration of the evaluation.

use crate::cache::KeyedCache;
use crate::digest::{Blob, ContentDigest, DigestWriter, Digestible};
use crate::error::CorralResult;
use crate::service::{alias_env, ClientId, ServiceBindings, ServiceRegistry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A content-addressed graph of serialized operations
///
/// Node order is not meaningful: producers emit nodes in an unstable
/// topological order, so nodes are sorted by byte content when digesting.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationGraph {
    pub nodes: Vec<Vec<u8>>,
    pub metadata: BTreeMap<String, String>,
}

impl OperationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a serialized operation
    pub fn with_node(mut self, node: impl Into<Vec<u8>>) -> Self {
        self.nodes.push(node.into());
        self
    }
}

impl Digestible for OperationGraph {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        let mut nodes: Vec<Blob<'_>> = self.nodes.iter().map(|n| Blob(n)).collect();
        nodes.sort_by(|a, b| a.0.cmp(b.0));
        w.field("nodes", &nodes)?;
        w.field("metadata", &self.metadata)
    }
}

/// Opaque handle to an evaluated graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    /// Key the result was computed for
    pub key: ContentDigest,
    /// Backend-specific reference to the output
    pub reference: String,
}

/// External build backend
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Execute `graph`; `env` maps service aliases to reachable hostnames
    async fn evaluate(
        &self,
        key: &ContentDigest,
        graph: &OperationGraph,
        env: &BTreeMap<String, String>,
    ) -> CorralResult<BuildResult>;
}

/// Deduplicating front for a [`BuildBackend`]
pub struct Materializer {
    cache: KeyedCache<BuildResult>,
    backend: Arc<dyn BuildBackend>,
    registry: ServiceRegistry,
}

impl Materializer {
    pub fn new(backend: Arc<dyn BuildBackend>, registry: ServiceRegistry) -> Self {
        Self {
            cache: KeyedCache::new(),
            backend,
            registry,
        }
    }

    /// Cache of results computed so far
    pub fn cache(&self) -> &KeyedCache<BuildResult> {
        &self.cache
    }

    /// Evaluate `graph` unless an identical graph was already evaluated
    pub async fn materialize(
        &self,
        graph: &OperationGraph,
        cancel: &CancellationToken,
    ) -> CorralResult<BuildResult> {
        let key = graph.content_digest()?;
        self.cache
            .get_or_initialize(&key, cancel, || async {
                debug!("Evaluating graph {}", key.short());
                self.backend.evaluate(&key, graph, &BTreeMap::new()).await
            })
            .await
    }

    /// Evaluate `graph` with `services` bound for the evaluation's duration
    ///
    /// The services are part of the cache key; they are only started when
    /// the result is not already cached.
    pub async fn materialize_with_services(
        &self,
        client: ClientId,
        graph: &OperationGraph,
        services: &ServiceBindings,
        cancel: &CancellationToken,
    ) -> CorralResult<BuildResult> {
        let mut w = DigestWriter::new();
        w.field("graph", graph)?;
        w.field("services", services)?;
        let key = w.finish();

        self.cache
            .get_or_initialize(&key, cancel, || async {
                self.registry
                    .with_services(client, services, cancel, |bound| async move {
                        let env = alias_env(bound.iter().map(|(b, h)| (b, h)));
                        debug!(
                            "Evaluating graph {} with {} service(s)",
                            key.short(),
                            bound.len()
                        );
                        self.backend.evaluate(&key, graph, &env).await
                    })
                    .await
            })
            .await
    }
}
