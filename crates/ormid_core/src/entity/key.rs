//! Primary keys and predicate identities.

use ormid_store::Value;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use uuid::Uuid;

/// A key type an identity cache can be parameterized by.
///
/// `from_components` receives the key component values in key order and
/// returns `None` unless every component has a concrete value of the
/// expected shape.
pub trait CacheKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Builds the key from component values.
    fn from_components(components: &[Value]) -> Option<Self>;
}

/// A scalar or composite primary key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PrimaryKey {
    /// Single-column key.
    Single(Value),
    /// Multi-column key, in key order.
    Composite(Vec<Value>),
}

impl PrimaryKey {
    /// Component values in key order.
    #[must_use]
    pub fn components(&self) -> &[Value] {
        match self {
            PrimaryKey::Single(v) => std::slice::from_ref(v),
            PrimaryKey::Composite(vs) => vs,
        }
    }
}

impl CacheKey for PrimaryKey {
    fn from_components(components: &[Value]) -> Option<Self> {
        if components.is_empty() || components.iter().any(Value::is_null) {
            return None;
        }
        Some(match components {
            [single] => PrimaryKey::Single(normalize(single)),
            many => PrimaryKey::Composite(many.iter().map(normalize).collect()),
        })
    }
}

/// Integer components compare by value whatever their width.
fn normalize(value: &Value) -> Value {
    match value {
        Value::Int(v) => Value::BigInt(i64::from(*v)),
        other => other.clone(),
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Single(v) => write!(f, "{v}"),
            PrimaryKey::Composite(vs) => {
                f.write_str("(")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl CacheKey for i64 {
    fn from_components(components: &[Value]) -> Option<Self> {
        match components {
            [v] => v.as_i64(),
            _ => None,
        }
    }
}

impl CacheKey for String {
    fn from_components(components: &[Value]) -> Option<Self> {
        match components {
            [v] => v.as_str().map(str::to_string),
            _ => None,
        }
    }
}

impl CacheKey for Uuid {
    fn from_components(components: &[Value]) -> Option<Self> {
        match components {
            [v] => v.as_uuid(),
            _ => None,
        }
    }
}

/// A query condition standing in for an entity's identity until the entity
/// is materialized by key.
///
/// The query translation layer produces the canonical text; two predicates
/// are the same identity iff their texts are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeflatedPredicate(Arc<str>);

impl DeflatedPredicate {
    /// Wraps canonical predicate text.
    pub fn new(expression: impl Into<String>) -> Self {
        Self(Arc::from(expression.into()))
    }

    /// The canonical text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeflatedPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
