//! Canonical hash stream used by every `Digestible` implementation

use super::{ContentDigest, Digestible};
use crate::error::{CorralError, CorralResult};
use sha2::{Digest, Sha256};

/// Streaming encoder that feeds a canonical form of a value into SHA-256
///
/// Every token is newline-terminated and carries a one-letter tag, so a
/// string never collides with a number or a structural marker.
pub struct DigestWriter {
    hasher: Sha256,
}

impl DigestWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Consume the writer and return the digest
    pub fn finish(self) -> ContentDigest {
        ContentDigest::from_bytes(self.hasher.finalize().into())
    }

    fn line(&mut self, tag: &str, body: &[u8]) {
        self.hasher.update(tag.as_bytes());
        self.hasher.update(b" ");
        self.hasher.update(body);
        self.hasher.update(b"\n");
    }

    /// Write any nested digestible value
    pub fn value<T: Digestible + ?Sized>(&mut self, value: &T) -> CorralResult<()> {
        value.digest_into(self)
    }

    /// Write a named record field followed by its value
    pub fn field<T: Digestible + ?Sized>(&mut self, name: &str, value: &T) -> CorralResult<()> {
        self.line("f", name.as_bytes());
        value.digest_into(self)
    }

    /// Write a string scalar (JSON-escaped)
    pub fn string(&mut self, s: &str) -> CorralResult<()> {
        let encoded = serde_json::to_vec(s)?;
        self.line("s", &encoded);
        Ok(())
    }

    /// Write a boolean scalar
    pub fn boolean(&mut self, b: bool) {
        self.line("b", if b { b"true" } else { b"false" });
    }

    /// Write an integer scalar
    ///
    /// Signed and unsigned integers share one encoding, so `1u64` and `1i64`
    /// hash identically.
    pub fn integer(&mut self, n: i128) {
        self.line("i", n.to_string().as_bytes());
    }

    /// Write a floating point scalar
    ///
    /// NaN and infinities have no canonical form and are rejected.
    pub fn float(&mut self, n: f64) -> CorralResult<()> {
        if !n.is_finite() {
            return Err(CorralError::DigestUnsupported {
                shape: "f64".to_string(),
                reason: format!("non-finite value {}", n),
            });
        }
        self.line("d", format!("{:?}", n).as_bytes());
        Ok(())
    }

    /// Write an opaque byte blob
    pub fn bytes(&mut self, bytes: &[u8]) {
        self.line("x", bytes.len().to_string().as_bytes());
        self.hasher.update(bytes);
        self.hasher.update(b"\n");
    }

    /// Write the sentinel for an absent value
    pub fn nil(&mut self) {
        self.hasher.update(b"nil\n");
    }

    /// Write an ordered sequence, positionally
    pub fn sequence<'a, T, I>(&mut self, items: I) -> CorralResult<()>
    where
        T: Digestible + 'a + ?Sized,
        I: IntoIterator<Item = &'a T>,
        I::IntoIter: ExactSizeIterator,
    {
        let items = items.into_iter();
        self.line("[", items.len().to_string().as_bytes());
        for (i, item) in items.enumerate() {
            self.line("#", i.to_string().as_bytes());
            item.digest_into(self)?;
        }
        self.hasher.update(b"]\n");
        Ok(())
    }

    /// Write an unordered map, sorting entries by key first
    pub fn map<'a, K, V, I>(&mut self, entries: I) -> CorralResult<()>
    where
        K: Digestible + Ord + 'a + ?Sized,
        V: Digestible + 'a + ?Sized,
        I: IntoIterator<Item = (&'a K, &'a V)>,
    {
        let mut entries: Vec<(&K, &V)> = entries.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        self.line("{", entries.len().to_string().as_bytes());
        for (k, v) in entries {
            k.digest_into(self)?;
            v.digest_into(self)?;
        }
        self.hasher.update(b"}\n");
        Ok(())
    }

    /// Write an unordered set, sorting members first
    pub fn set<'a, T, I>(&mut self, members: I) -> CorralResult<()>
    where
        T: Digestible + Ord + 'a + ?Sized,
        I: IntoIterator<Item = &'a T>,
    {
        let mut members: Vec<&T> = members.into_iter().collect();
        members.sort();
        self.sequence(members)
    }
}

impl Default for DigestWriter {
    fn default() -> Self {
        Self::new()
    }
}
