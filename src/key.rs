//! Cache key definitions.
//!
//! A key is an ordered sequence of discriminators: resource kind, scope, and
//! an optional qualifier (a canonicalized filter object for lists, an
//! identifier for details). Keys form a prefix hierarchy: `[kind, List]` is a
//! prefix of `[kind, List, {filter}]`, and invalidating a prefix covers every
//! key that extends it.

use std::fmt;

use serde_json::Value;

use crate::kind::ResourceKind;

/// Sub-scope of a cache key within a resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// A collection view, optionally narrowed by a filter object.
    List,
    /// A single resource addressed by identifier.
    Detail,
    /// A derived aggregate view (e.g. membership statistics).
    Stats,
}

/// Trailing key discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Qualifier {
    /// Canonicalized filter parameters for a list view.
    Filter(CanonicalFilter),
    /// Resource identifier for a detail view.
    Id(String),
}

/// Identifies one cache entry.
///
/// Equality is structural: two keys built from the same `(kind, scope,
/// params)` always compare equal, regardless of how the params object was
/// assembled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    kind: ResourceKind,
    scope: Scope,
    qualifier: Option<Qualifier>,
}

impl CacheKey {
    /// Key for the unfiltered list view of a kind.
    ///
    /// Also acts as the prefix covering every filtered list key of the kind.
    pub fn list(kind: ResourceKind) -> Self {
        Self {
            kind,
            scope: Scope::List,
            qualifier: None,
        }
    }

    /// Key for a list view narrowed by a filter object.
    pub fn filtered_list(kind: ResourceKind, params: &Value) -> Self {
        Self {
            kind,
            scope: Scope::List,
            qualifier: Some(Qualifier::Filter(CanonicalFilter::new(params))),
        }
    }

    /// Key for the detail view of a single resource.
    pub fn detail(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            scope: Scope::Detail,
            qualifier: Some(Qualifier::Id(id.into())),
        }
    }

    /// Key for a derived aggregate view of a kind.
    pub fn stats(kind: ResourceKind) -> Self {
        Self {
            kind,
            scope: Scope::Stats,
            qualifier: None,
        }
    }

    /// True iff every element of `self` matches the corresponding element of
    /// `other` and `self` is no longer than `other`.
    pub fn is_prefix_of(&self, other: &CacheKey) -> bool {
        if self.kind != other.kind || self.scope != other.scope {
            return false;
        }
        match (&self.qualifier, &other.qualifier) {
            (None, _) => true,
            (Some(a), Some(b)) => a == b,
            (Some(_), None) => false,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// The detail identifier, when this is a detail key.
    pub fn id(&self) -> Option<&str> {
        match &self.qualifier {
            Some(Qualifier::Id(id)) => Some(id),
            _ => None,
        }
    }

    /// The canonical filter, when this is a filtered list key.
    pub fn filter(&self) -> Option<&CanonicalFilter> {
        match &self.qualifier {
            Some(Qualifier::Filter(filter)) => Some(filter),
            _ => None,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.name())?;
        match self.scope {
            Scope::List => write!(f, "/list")?,
            Scope::Detail => write!(f, "/detail")?,
            Scope::Stats => write!(f, "/stats")?,
        }
        match &self.qualifier {
            Some(Qualifier::Filter(filter)) => write!(f, "/{}", filter.as_str()),
            Some(Qualifier::Id(id)) => write!(f, "/{id}"),
            None => Ok(()),
        }
    }
}

/// A filter object reduced to a canonical textual form.
///
/// Object keys are recursively sorted before serialization, so two filters
/// that differ only in property insertion order compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalFilter(String);

impl CanonicalFilter {
    pub fn new(params: &Value) -> Self {
        let mut out = String::new();
        write_canonical(params, &mut out);
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by_key(|(k, _)| k.as_str());
            out.push('{');
            for (i, (k, v)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*k).clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
