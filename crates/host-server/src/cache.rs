//! Result cache keyed by (operation name, caller-supplied cache key).
//!
//! Only successes are stored, and the first one stored under a key stays:
//! later results for the same key are discarded.

use dashmap::DashMap;
use serde_json::Value;

#[derive(Debug, Default)]
pub struct ResultCache {
    entries: DashMap<(String, String), Value>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, operation: &str, key: &str) -> Option<Value> {
        self.entries
            .get(&(operation.to_string(), key.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Store `value` unless something is already cached under the key.
    pub fn store(&self, operation: &str, key: &str, value: Value) {
        self.entries
            .entry((operation.to_string(), key.to_string()))
            .or_insert(value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_result_is_kept() {
        let cache = ResultCache::new();
        cache.store("echo", "foo", json!("test1"));
        cache.store("echo", "foo", json!("test3"));
        assert_eq!(cache.get("echo", "foo"), Some(json!("test1")));
    }

    #[test]
    fn keys_are_scoped_per_operation() {
        let cache = ResultCache::new();
        cache.store("echo", "foo", json!("a"));
        cache.store("echo_data", "foo", json!("b"));
        assert_eq!(cache.get("echo", "foo"), Some(json!("a")));
        assert_eq!(cache.get("echo_data", "foo"), Some(json!("b")));
        assert!(cache.get("echo", "bar").is_none());
        assert_eq!(cache.len(), 2);
    }
}
