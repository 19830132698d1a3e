//! In-memory cache of last-observed NodeReadinessRules
//!
//! The rule reconciler writes the cache on every rule event; the node
//! reconciler reads it on every node event so a single node change can be
//! checked against all rules without a round of API list calls per rule.
//! Entries are `Arc` snapshots: a reader holds an immutable view even while a
//! writer swaps the entry underneath it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::crd::NodeReadinessRule;

/// Shared rule-name → rule-snapshot map guarded by a reader/writer lock.
///
/// Cloning the cache clones the handle, not the contents.
#[derive(Clone, Default)]
pub struct RuleCache {
    inner: Arc<RwLock<HashMap<String, Arc<NodeReadinessRule>>>>,
}

impl RuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace (or insert) the snapshot for a rule.
    pub fn put(&self, rule: NodeReadinessRule) {
        let name = rule.metadata.name.clone().unwrap_or_default();
        let mut map = self.inner.write().expect("rule cache lock poisoned");
        map.insert(name, Arc::new(rule));
    }

    /// Snapshot of a single rule, if cached.
    pub fn get(&self, name: &str) -> Option<Arc<NodeReadinessRule>> {
        let map = self.inner.read().expect("rule cache lock poisoned");
        map.get(name).cloned()
    }

    /// Drop a rule from the cache. Subsequent `get` returns `None`.
    pub fn delete(&self, name: &str) {
        let mut map = self.inner.write().expect("rule cache lock poisoned");
        map.remove(name);
    }

    /// Snapshot of all cached rules, sorted by name for deterministic
    /// iteration order.
    pub fn list(&self) -> Vec<Arc<NodeReadinessRule>> {
        let map = self.inner.read().expect("rule cache lock poisoned");
        let mut rules: Vec<_> = map.values().cloned().collect();
        rules.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        rules
    }

    /// Names of all cached rules, sorted.
    pub fn names(&self) -> Vec<String> {
        let map = self.inner.read().expect("rule cache lock poisoned");
        let mut names: Vec<_> = map.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("rule cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
