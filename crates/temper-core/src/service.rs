//! Service name resolution.
//!
//! Services are stored in the registry under `(name, ProviderKey)`. A
//! context's [`ServiceMapping`] decides which key a name resolves to, so an
//! isolated subtree sees its own provider while the rest of the tree keeps
//! the shared one.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Type-erased service instance.
pub type ServiceArc = Arc<dyn Any + Send + Sync>;

/// Opaque identity of a service provider slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderKey(u64);

impl ProviderKey {
    /// The slot every unshadowed name resolves to.
    pub const ROOT: ProviderKey = ProviderKey(0);

    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Service name to provider key mapping carried by every context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMapping {
    shadows: HashMap<String, ProviderKey>,
}

impl ServiceMapping {
    pub fn resolve(&self, name: &str) -> ProviderKey {
        self.shadows.get(name).copied().unwrap_or(ProviderKey::ROOT)
    }

    /// Names that are shadowed by this mapping.
    pub fn isolated(&self) -> BTreeSet<&str> {
        self.shadows.keys().map(String::as_str).collect()
    }

    /// Returns a copy with `names` bound to freshly allocated keys.
    pub(crate) fn shadow<I, F>(&self, names: I, mut next_key: F) -> ServiceMapping
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        F: FnMut() -> ProviderKey,
    {
        let mut shadows = self.shadows.clone();
        for name in names {
            shadows.insert(name.as_ref().to_string(), next_key());
        }
        ServiceMapping { shadows }
    }

    /// Names whose resolved key differs between `self` and `other`.
    pub fn diff(&self, other: &ServiceMapping) -> Vec<String> {
        let names: BTreeSet<&String> = self.shadows.keys().chain(other.shadows.keys()).collect();
        names
            .into_iter()
            .filter(|name| self.resolve(name) != other.resolve(name))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unshadowed_names_resolve_to_root() {
        let mapping = ServiceMapping::default();
        assert_eq!(mapping.resolve("database"), ProviderKey::ROOT);
    }

    #[test]
    fn test_shadow_and_diff() {
        let base = ServiceMapping::default();
        let mut counter = 10;
        let isolated = base.shadow(["database", "cache"], || {
            counter += 1;
            ProviderKey::new(counter)
        });

        assert_ne!(isolated.resolve("database"), ProviderKey::ROOT);
        assert_eq!(isolated.resolve("http"), ProviderKey::ROOT);
        assert_eq!(base.diff(&isolated), vec!["cache".to_string(), "database".to_string()]);
        assert!(isolated.diff(&isolated.clone()).is_empty());
    }
}
