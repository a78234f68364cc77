// src/cache.rs
//
// Prefix-keyed cache in front of the tariff storage. A reload publishes the
// complete entry set for a group of prefixes in one swap, so concurrent
// readers observe either the previous or the new snapshot, never a mix.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type Shard = HashMap<String, Arc<String>>;

#[derive(Default)]
pub struct Cache {
    inner: RwLock<HashMap<String, Shard>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, prefix: &str, key: &str) -> Option<Arc<String>> {
        let inner = self.inner.read().expect("cache lock poisoned");
        inner.get(prefix).and_then(|shard| shard.get(key).cloned())
    }

    pub fn set(&self, prefix: &str, key: &str, value: String) {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        inner
            .entry(prefix.to_string())
            .or_default()
            .insert(key.to_string(), Arc::new(value));
    }

    /// Replace every entry under the given prefixes with the supplied
    /// snapshot in a single atomic swap.
    pub fn publish(&self, prefixes: &[&str], snapshot: HashMap<String, Shard>) {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        for prefix in prefixes {
            inner.remove(*prefix);
        }
        for (prefix, shard) in snapshot {
            inner.insert(prefix, shard);
        }
    }

    pub fn remove_prefix(&self, prefix: &str) {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        inner.remove(prefix);
    }

    pub fn count_entries(&self, prefix: &str) -> usize {
        let inner = self.inner.read().expect("cache lock poisoned");
        inner.get(prefix).map(|shard| shard.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_count() {
        let cache = Cache::new();
        cache.set("dst_", "447596", "[\"DST_UK\"]".to_string());
        cache.set("dst_", "447956", "[\"DST_UK\"]".to_string());
        cache.set("rpl_", "RP_UK", "{}".to_string());

        assert_eq!(cache.count_entries("dst_"), 2);
        assert_eq!(cache.count_entries("rpl_"), 1);
        assert_eq!(cache.count_entries("rpf_"), 0);
        assert_eq!(cache.get("dst_", "447596").unwrap().as_str(), "[\"DST_UK\"]");
    }

    #[test]
    fn test_publish_replaces_whole_prefix() {
        let cache = Cache::new();
        cache.set("dst_", "stale", "x".to_string());

        let mut snapshot: HashMap<String, Shard> = HashMap::new();
        let mut shard = Shard::new();
        shard.insert("fresh".to_string(), Arc::new("y".to_string()));
        snapshot.insert("dst_".to_string(), shard);

        cache.publish(&["dst_"], snapshot);
        assert!(cache.get("dst_", "stale").is_none());
        assert_eq!(cache.count_entries("dst_"), 1);
    }
}
