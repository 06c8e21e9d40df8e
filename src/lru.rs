//! 按字节计费的线程安全 LRU

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LruStats {
    pub entries:  usize,
    pub size:     usize,
    pub capacity: usize,
    pub hits:     u64,
    pub misses:   u64,
}

struct Entry<V> {
    value:  V,
    charge: usize,
    tick:   u64,
}

struct Inner<K, V> {
    entries:  HashMap<K, Entry<V>>,
    /// tick → key，最小的 tick 最久未访问
    order:    BTreeMap<u64, K>,
    next_tick: u64,
    size:     usize,
    capacity: usize,
    hits:     u64,
    misses:   u64,
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn touch(&mut self, key: &K) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(e) = self.entries.get_mut(key) {
            self.order.remove(&e.tick);
            e.tick = tick;
            self.order.insert(tick, key.clone());
        }
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let e = self.entries.remove(key)?;
        self.order.remove(&e.tick);
        self.size -= e.charge;
        Some(e.value)
    }

    fn pop_lru(&mut self) -> Option<(K, V)> {
        let (_, key) = self.order.pop_first()?;
        let e = self.entries.remove(&key)?;
        self.size -= e.charge;
        Some((key, e.value))
    }
}

pub struct LruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries:   HashMap::new(),
                order:     BTreeMap::new(),
                next_tick: 0,
                size:      0,
                capacity,
                hits:      0,
                misses:    0,
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key).map(|e| e.value.clone()) {
            Some(v) => {
                inner.hits += 1;
                inner.touch(key);
                Some(v)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// 插入并返回因容量不足被淘汰的条目。单个条目超过容量时不缓存。
    pub fn insert(&self, key: K, value: V, charge: usize) -> Vec<(K, V)> {
        let mut inner = self.inner.lock();
        inner.remove(&key);
        if charge > inner.capacity {
            return Vec::new();
        }
        let mut evicted = Vec::new();
        while inner.size + charge > inner.capacity {
            match inner.pop_lru() {
                Some(kv) => evicted.push(kv),
                None => break,
            }
        }
        let tick = inner.next_tick;
        inner.next_tick += 1;
        inner.order.insert(tick, key.clone());
        inner.entries.insert(key, Entry { value, charge, tick });
        inner.size += charge;
        evicted
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().remove(key)
    }

    /// 删除所有满足条件的 key
    pub fn remove_if(&self, mut pred: impl FnMut(&K) -> bool) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<K> = inner.entries.keys().filter(|k| pred(k)).cloned().collect();
        for k in &keys {
            inner.remove(k);
        }
        keys.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.size = 0;
    }

    pub fn stats(&self) -> LruStats {
        let inner = self.inner.lock();
        LruStats {
            entries:  inner.entries.len(),
            size:     inner.size,
            capacity: inner.capacity,
            hits:     inner.hits,
            misses:   inner.misses,
        }
    }
}
