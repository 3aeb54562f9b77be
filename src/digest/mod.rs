//! Content digests for cache keys and resource identities
//!
//! Values are hashed by writing a canonical encoding of their structure
//! into a SHA-256 stream:
//!
//! | Shape | Encoding |
//! |-------|----------|
//! | Record | field name, then field value, in declaration order |
//! | Sequence | length header, then index and value per element |
//! | Map / set | entries sorted by key, independent of iteration order |
//! | Blob | length-prefixed opaque bytes |
//! | Absent | `nil` sentinel |
//!
//! The set of shapes is closed: a type becomes digestible by implementing
//! [`Digestible`] in terms of the [`DigestWriter`] primitives.

mod value;
mod writer;

pub use value::{Blob, Value};
pub use writer::DigestWriter;

use crate::error::{CorralError, CorralResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix used in the textual form of a digest
const ALGORITHM: &str = "sha256";

/// Number of hex characters in the short form
const SHORT_LEN: usize = 12;

/// An order-independent SHA-256 hash of a value's structure
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full hex encoding (64 chars, no algorithm prefix)
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for log lines and display
    pub fn short(&self) -> String {
        hex::encode(&self.0[..SHORT_LEN / 2])
    }

    /// DNS-safe label derived from the digest
    ///
    /// Starts with a letter so it is always a valid hostname label.
    pub fn host_hash(&self) -> String {
        let mut host = String::with_capacity(14);
        host.push('h');
        host.push_str(&hex::encode(&self.0[..6]));
        host
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", ALGORITHM, self.hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.short())
    }
}

impl FromStr for ContentDigest {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s
            .strip_prefix(ALGORITHM)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| CorralError::DigestInvalid(format!("missing '{}:' prefix in {}", ALGORITHM, s)))?;

        let bytes = hex::decode(hex_part)
            .map_err(|e| CorralError::DigestInvalid(format!("{}: {}", s, e)))?;

        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CorralError::DigestInvalid(format!("{}: expected 32 bytes", s)))?;

        Ok(Self(bytes))
    }
}

impl From<ContentDigest> for String {
    fn from(digest: ContentDigest) -> Self {
        digest.to_string()
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = CorralError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A value that can be hashed into a [`ContentDigest`]
pub trait Digestible {
    /// Write this value's canonical encoding into `w`
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()>;

    /// Compute this value's content digest
    fn content_digest(&self) -> CorralResult<ContentDigest> {
        let mut w = DigestWriter::new();
        self.digest_into(&mut w)?;
        Ok(w.finish())
    }
}

impl Digestible for ContentDigest {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.bytes(&self.0);
        Ok(())
    }
}

/// Compute the content digest of any digestible value
pub fn digest<T: Digestible + ?Sized>(value: &T) -> CorralResult<ContentDigest> {
    value.content_digest()
}
