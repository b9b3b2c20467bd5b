//! The reader environment.
//!
//! An `Environment` is an immutable map from string keys to values.
//! Updates are replace-and-restore: `with` produces a new environment, and
//! scope exit restores the saved one (the machine saves environments in
//! `Return` and `WithHandler` frames, never mutates one in place).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::values::Value;

/// An immutable reader context.
#[derive(Clone, PartialEq, Default)]
pub struct Environment(Arc<BTreeMap<String, Value>>);

impl Environment {
    /// The empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an environment from key/value pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self(Arc::new(pairs.into_iter().collect()))
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Return a new environment with `key` bound to `value`.
    pub fn with(&self, key: impl Into<String>, value: Value) -> Self {
        let mut next = (*self.0).clone();
        next.insert(key.into(), value);
        Self(Arc::new(next))
    }

    /// Return a new environment extended with every pair in `updates`.
    pub fn extended(&self, updates: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut next = (*self.0).clone();
        next.extend(updates);
        Self(Arc::new(next))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_does_not_mutate_the_original() {
        let base = Environment::from_pairs([("a".to_string(), Value::Int(1))]);
        let extended = base.with("b", Value::Int(2));
        assert!(base.get("b").is_none());
        assert_eq!(extended.get("a"), Some(&Value::Int(1)));
        assert_eq!(extended.get("b"), Some(&Value::Int(2)));
    }

    #[test]
    fn with_replaces_existing_bindings() {
        let base = Environment::from_pairs([("a".to_string(), Value::Int(1))]);
        let shadowed = base.with("a", Value::Int(9));
        assert_eq!(base.get("a"), Some(&Value::Int(1)));
        assert_eq!(shadowed.get("a"), Some(&Value::Int(9)));
    }

    #[test]
    fn clones_share_structure() {
        let base = Environment::from_pairs([("a".to_string(), Value::Int(1))]);
        let copy = base.clone();
        assert_eq!(base, copy);
    }
}
