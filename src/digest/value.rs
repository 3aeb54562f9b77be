//! Digestible implementations for the closed set of value shapes

use super::{DigestWriter, Digestible};
use crate::error::{CorralError, CorralResult};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Dynamically-shaped value, for data that arrives untyped (JSON, TOML)
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i128),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
}

impl Digestible for Value {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        match self {
            Value::Null => {
                w.nil();
                Ok(())
            }
            Value::Bool(b) => {
                w.boolean(*b);
                Ok(())
            }
            Value::Int(n) => {
                w.integer(*n);
                Ok(())
            }
            Value::Float(n) => w.float(*n),
            Value::String(s) => w.string(s),
            Value::Bytes(b) => {
                w.bytes(b);
                Ok(())
            }
            Value::List(items) => w.sequence(items),
            Value::Map(entries) => w.map(entries),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i128::from(i))
                } else if let Some(u) = n.as_u64() {
                    Value::Int(i128::from(u))
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl TryFrom<toml::Value> for Value {
    type Error = CorralError;

    fn try_from(value: toml::Value) -> Result<Self, Self::Error> {
        Ok(match value {
            toml::Value::String(s) => Value::String(s),
            toml::Value::Integer(i) => Value::Int(i128::from(i)),
            toml::Value::Float(f) => Value::Float(f),
            toml::Value::Boolean(b) => Value::Bool(b),
            toml::Value::Datetime(dt) => Value::String(dt.to_string()),
            toml::Value::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<CorralResult<_>>()?,
            ),
            toml::Value::Table(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, Value::try_from(v)?)))
                    .collect::<CorralResult<_>>()?,
            ),
        })
    }
}

impl Digestible for serde_json::Value {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        Value::from(self.clone()).digest_into(w)
    }
}

/// Opaque byte string, hashed whole rather than element by element
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Blob<'a>(pub &'a [u8]);

impl Digestible for Blob<'_> {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.bytes(self.0);
        Ok(())
    }
}

impl Digestible for str {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.string(self)
    }
}

impl Digestible for String {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.string(self)
    }
}

impl Digestible for bool {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.boolean(*self);
        Ok(())
    }
}

macro_rules! digest_integer {
    ($($ty:ty),*) => {
        $(
            impl Digestible for $ty {
                fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
                    w.integer(i128::from(*self));
                    Ok(())
                }
            }
        )*
    };
}

digest_integer!(u8, u16, u32, u64, i8, i16, i32, i64);

impl Digestible for usize {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.integer(*self as i128);
        Ok(())
    }
}

impl Digestible for f64 {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.float(*self)
    }
}

impl<T: Digestible> Digestible for [T] {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.sequence(self)
    }
}

impl<T: Digestible> Digestible for Vec<T> {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.sequence(self)
    }
}

impl<T: Digestible> Digestible for Option<T> {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        match self {
            Some(value) => value.digest_into(w),
            None => {
                w.nil();
                Ok(())
            }
        }
    }
}

impl<T: Digestible + ?Sized> Digestible for &T {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        (**self).digest_into(w)
    }
}

impl<T: Digestible + ?Sized> Digestible for Box<T> {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        (**self).digest_into(w)
    }
}

impl<T: Digestible + ?Sized> Digestible for Arc<T> {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        (**self).digest_into(w)
    }
}

impl<K: Digestible + Ord, V: Digestible, S> Digestible for HashMap<K, V, S> {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.map(self.iter())
    }
}

impl<K: Digestible + Ord, V: Digestible> Digestible for BTreeMap<K, V> {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.map(self.iter())
    }
}

impl<T: Digestible + Ord, S> Digestible for HashSet<T, S> {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.set(self.iter())
    }
}

impl<T: Digestible + Ord> Digestible for BTreeSet<T> {
    fn digest_into(&self, w: &mut DigestWriter) -> CorralResult<()> {
        w.set(self.iter())
    }
}
