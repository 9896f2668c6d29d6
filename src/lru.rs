use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use serde::Serialize;

/// Usage counters exposed in the result JSON.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheCounters {
    pub hit: u64,
    pub miss: u64,
    pub cached: usize,
}

/// Insertion-ordered mapping with a maximum size.
///
/// `get` moves the entry to most-recently-used, `put` evicts the
/// least-recently-used entries until the cache fits. A limit of zero disables
/// eviction entirely.
pub struct LruCache<K, V> {
    limit: usize,
    stamp: u64,
    entries: HashMap<K, (V, u64)>,
    order: BTreeMap<u64, K>,
    hit: u64,
    miss: u64,
}

impl<K, V> LruCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            stamp: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            hit: 0,
            miss: 0,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        self.stamp += 1;
        let stamp = self.stamp;
        match self.entries.get_mut(key) {
            Some((value, last_used)) => {
                self.order.remove(last_used);
                *last_used = stamp;
                self.order.insert(stamp, key.clone());
                self.hit += 1;
                Some(value.clone())
            }
            None => {
                self.miss += 1;
                None
            }
        }
    }

    pub fn put(&mut self, key: K, value: V) {
        self.stamp += 1;
        let stamp = self.stamp;
        if let Some((old_value, last_used)) = self.entries.get_mut(&key) {
            self.order.remove(last_used);
            *old_value = value;
            *last_used = stamp;
            self.order.insert(stamp, key);
        } else {
            self.entries.insert(key.clone(), (value, stamp));
            self.order.insert(stamp, key);
        }

        if self.limit > 0 {
            while self.entries.len() > self.limit {
                let (_, evicted) = self.order.pop_first().unwrap();
                self.entries.remove(&evicted);
            }
        }
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            hit: self.hit,
            miss: self.miss,
            cached: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LruCache;

    #[test]
    fn test_eviction_order() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);

        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn test_get_refreshes_recency() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));

        cache.put("c", 3);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn test_counters() {
        let mut cache = LruCache::new(10);
        cache.put(1, "one");
        cache.get(&1);
        cache.get(&2);
        cache.get(&2);

        let counters = cache.counters();
        assert_eq!(counters.hit, 1);
        assert_eq!(counters.miss, 2);
        assert_eq!(counters.cached, 1);
    }

    #[test]
    fn test_zero_limit_never_evicts() {
        let mut cache = LruCache::new(0);
        for i in 0..1000 {
            cache.put(i, i);
        }

        assert_eq!(cache.len(), 1000);
        assert_eq!(cache.get(&0), Some(0));
    }

    #[test]
    fn test_put_replaces_value() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("a", 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"a"), Some(2));
    }
}
