use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

/// A concurrent map with lock-free reads and copy-on-write updates.
///
/// Readers load an immutable snapshot; writers clone the map, mutate the
/// clone, and swap it in with a CAS loop. This fits the connection tables:
/// lookups happen on every message, while inserts and removals happen once per
/// connection lifecycle. Iteration over a snapshot is weakly consistent, which
/// is all the periodic sweeps need.
pub struct AtomicMap<K, V> {
    map: AtomicPtr<Arc<FxHashMap<K, V>>>,
}

impl<K: Hash + Eq + Clone + Sync + Send, V: Clone + Sync + Send> Default for AtomicMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone + Sync + Send, V: Clone + Sync + Send> AtomicMap<K, V> {
    pub fn new() -> AtomicMap<K, V> {
        let map = Arc::new(FxHashMap::<K, V>::default());
        let raw = Box::into_raw(Box::new(map));

        AtomicMap {
            map: AtomicPtr::new(raw),
        }
    }

    /// An immutable snapshot of the current state.
    pub fn load(&self) -> Arc<FxHashMap<K, V>> {
        unsafe { (*self.map.load(Ordering::Acquire)).clone() }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        unsafe { (*self.map.load(Ordering::Acquire)).get(key).cloned() }
    }

    pub fn len(&self) -> usize {
        unsafe { (*self.map.load(Ordering::Acquire)).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn update(&self, f: impl Fn(&mut FxHashMap<K, V>)) {
        loop {
            let old = self.map.load(Ordering::Acquire);

            let mut map: FxHashMap<K, V> = unsafe { (**old).clone() };
            f(&mut map);
            let new = Box::into_raw(Box::new(Arc::new(map)));

            match self
                .map
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(prev) => {
                    unsafe {
                        drop(Box::from_raw(prev));
                    }
                    return;
                }
                Err(_) => unsafe {
                    drop(Box::from_raw(new));
                },
            }
        }
    }

    /// Inserts `value` under `key` unless the key is present: first writer
    /// wins, losers adopt the resident value. Returns the value now in the map
    /// and whether this call inserted it.
    pub fn insert_if_absent(&self, key: K, value: V) -> (V, bool) {
        loop {
            let old = self.map.load(Ordering::Acquire);
            if let Some(existing) = unsafe { (**old).get(&key) } {
                return (existing.clone(), false);
            }

            let mut map: FxHashMap<K, V> = unsafe { (**old).clone() };
            map.insert(key.clone(), value.clone());
            let new = Box::into_raw(Box::new(Arc::new(map)));

            match self
                .map
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(prev) => {
                    unsafe {
                        drop(Box::from_raw(prev));
                    }
                    return (value, true);
                }
                Err(_) => unsafe {
                    drop(Box::from_raw(new));
                },
            }
        }
    }

    pub fn remove(&self, key: &K) {
        self.update(|map| {
            map.remove(key);
        });
    }

    pub fn clear(&self) {
        self.update(|map| map.clear());
    }
}

impl<K, V> Drop for AtomicMap<K, V> {
    fn drop(&mut self) {
        unsafe {
            let raw = self.map.load(Ordering::Acquire);
            drop(Box::from_raw(raw));
        }
    }
}
