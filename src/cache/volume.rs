//! Persistent cache volume identities
//!
//! A cache volume is named by the ordered list of keys it was created
//! with. Same keys = same volume, across every client of the engine.

use crate::digest::{DigestWriter, Digestible};
use crate::error::CorralResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A persistent volume with a globally scoped identifier
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheVolume {
    /// Ordered keys naming the volume
    pub keys: Vec<String>,
}

impl CacheVolume {
    /// Create a volume from its keys
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Return a copy with one more key appended
    pub fn with_key(&self, key: impl Into<String>) -> Self {
        let mut volume = self.clone();
        volume.keys.push(key.into());
        volume
    }

    /// Checksum of the keys, suitable as a backend cache mount ID
    ///
    /// Each key is NUL-terminated so `["ab", "c"]` and `["a", "bc"]` differ.
    pub fn sum(&self) -> String {
        let mut hasher = Sha256::new();
        for key in &self.keys {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Volume name used by container runtimes
    pub fn volume_name(&self) -> String {
        format!("corral-cache-{}", &self.sum()[..12])
    }
}

impl Digestible for CacheVolume {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.field("keys", &self.keys)
    }
}
