use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

/// Thread-safe in-process map used by every warm cache in the gateway.
///
/// There is no eviction: entries stay until they are deleted.
#[derive(Debug)]
pub struct Cache<K, V> {
    inner: Mutex<HashMap<K, V>>,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains_key(key)
    }

    pub fn set(&self, key: K, value: V) {
        self.inner.lock().insert(key, value);
    }

    pub fn delete<'a, I>(&self, keys: I)
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let mut map = self.inner.lock();
        for key in keys {
            map.remove(key);
        }
    }

    pub fn get_all(&self) -> HashMap<K, V> {
        self.inner.lock().clone()
    }

    /// Replace the whole content in one step, used by warm-up/refresh.
    pub fn replace_all(&self, entries: impl IntoIterator<Item = (K, V)>) {
        let fresh: HashMap<K, V> = entries.into_iter().collect();
        *self.inner.lock() = fresh;
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn set_get_delete() {
        let cache: Cache<String, i32> = Cache::new(4);
        cache.set("a".into(), 1);
        cache.set("b".into(), 2);
        cache.set("c".into(), 3);

        assert_eq!(cache.get(&"a".into()), Some(1));
        cache.delete([&"a".to_string(), &"b".to_string()]);
        assert_eq!(cache.get(&"a".into()), None);
        assert!(!cache.contains(&"b".into()));
        assert_eq!(cache.get_all().len(), 1);
    }

    #[test]
    fn replace_all_drops_stale_entries() {
        let cache: Cache<i64, &str> = Cache::new(2);
        cache.set(1, "old");
        cache.replace_all([(2, "new")]);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some("new"));
    }

    #[test]
    fn concurrent_writers() {
        let cache = Arc::new(Cache::<usize, usize>::new(0));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        cache.set(t * 100 + i, i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 800);
    }
}
