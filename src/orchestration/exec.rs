//! Fully-resolved execution specs handed to runtimes

use crate::cache::CacheVolume;
use crate::digest::{DigestWriter, Digestible};
use crate::error::CorralResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A cache volume mounted into a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMount {
    /// Mount point inside the resource
    pub target: String,
    /// Volume identity
    pub volume: CacheVolume,
}

impl Digestible for CacheMount {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.field("target", &self.target)?;
        w.field("volume", &self.volume)
    }
}

/// Everything a runtime needs to start one resource
#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    /// Container image (ignored by the host-process backend)
    pub image: Option<String>,
    /// Command and arguments
    pub args: Vec<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Working directory inside the resource
    pub workdir: Option<String>,
    /// Hostname the resource is reachable at
    pub hostname: String,
    /// Network mode
    pub network: String,
    /// Additional volume mounts (host:container)
    pub volumes: Vec<String>,
    /// Cache volume mounts
    pub caches: Vec<CacheMount>,
}

impl ExecSpec {
    /// Render the command line for log messages
    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }
}
