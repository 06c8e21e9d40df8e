use std::sync::Arc;

use parking_lot::Mutex;

use super::{CacheEngine, CacheKey, CacheStats};
use crate::common::{LakeError, Result};
use crate::lru::LruCache;

/// 纯内存引擎，容量不足时直接丢弃最久未用的块
pub struct MemoryCacheEngine {
    blocks: LruCache<CacheKey, Arc<Vec<u8>>>,
    // 保证 "检查是否存在 + 写入" 原子
    write_lock: Mutex<()>,
}

impl MemoryCacheEngine {
    pub fn new(capacity: usize) -> Self {
        Self { blocks: LruCache::new(capacity), write_lock: Mutex::new(()) }
    }
}

impl CacheEngine for MemoryCacheEngine {
    fn write(&self, key: &CacheKey, data: &[u8], overwrite: bool) -> Result<()> {
        let _guard = self.write_lock.lock();
        if !overwrite && self.blocks.contains(key) {
            return Err(LakeError::AlreadyExists(format!("cache block {}@{}", key.key, key.offset)));
        }
        self.blocks.insert(key.clone(), Arc::new(data.to_vec()), data.len());
        Ok(())
    }

    fn read(&self, key: &CacheKey) -> Result<Vec<u8>> {
        self.blocks
            .get(key)
            .map(|b| b.as_ref().clone())
            .ok_or_else(|| LakeError::NotFound(format!("cache block {}@{}", key.key, key.offset)))
    }

    fn remove(&self, key: &CacheKey) -> Result<()> {
        self.blocks.remove(key);
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        let s = self.blocks.stats();
        CacheStats {
            mem_entries: s.entries,
            mem_bytes:   s.size,
            hits:        s.hits,
            misses:      s.misses,
            ..Default::default()
        }
    }

    fn shutdown(&self) -> Result<()> {
        self.blocks.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_flag_is_honoured() {
        let e = MemoryCacheEngine::new(100);
        let k = CacheKey::new("f", 0);
        e.write(&k, b"a", false).unwrap();
        assert!(e.write(&k, b"b", false).unwrap_err().is_already_exists());
        e.write(&k, b"c", true).unwrap();
        assert_eq!(e.read(&k).unwrap(), b"c");
        e.remove(&k).unwrap();
        assert!(e.read(&k).unwrap_err().is_not_found());
    }
}
