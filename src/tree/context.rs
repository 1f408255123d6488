use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// 共享上下文 (Shared Context)
/// Tree-wide data, created for a root and referenced by every descendant.
/// Writes are not serialized beyond per-key atomicity.
#[derive(Clone, Debug, Default)] // cheap to clone (just an Arc)
pub struct SharedContext {
    vars: Arc<DashMap<String, Value>>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vars(initial: HashMap<String, Value>) -> Self {
        let ctx = Self::new();
        for (k, v) in initial {
            ctx.vars.insert(k, v);
        }
        ctx
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.vars.get(key).map(|v| v.value().clone())
    }

    pub fn set(&self, key: &str, value: Value) {
        self.vars.insert(key.to_string(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.vars.remove(key).map(|(_, v)| v)
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.vars
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn clear(&self) {
        self.vars.clear();
    }

    /// True when both handles point at the same tree context.
    pub fn same_as(&self, other: &SharedContext) -> bool {
        Arc::ptr_eq(&self.vars, &other.vars)
    }
}
