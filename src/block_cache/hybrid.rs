use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{CacheEngine, CacheKey, CacheStats};
use crate::common::{LakeError, Result};
use crate::config::DiskSpace;
use crate::lru::LruCache;

#[derive(Debug, Clone)]
struct DiskEntry {
    path: PathBuf,
    size: usize,
    crc:  u32,
}

/// 单个磁盘目录，按配额做 LRU
struct DiskTier {
    dir:   PathBuf,
    index: LruCache<CacheKey, DiskEntry>,
}

impl DiskTier {
    fn remove_files(entries: Vec<(CacheKey, DiskEntry)>) {
        for (key, e) in entries {
            if let Err(err) = fs::remove_file(&e.path) {
                warn!(target: "lake", key = %key.key, offset = key.offset, error = %err, "remove disk cache file failed");
            }
        }
    }
}

/// 内存 + 磁盘两级引擎。内存淘汰的块写入磁盘层；磁盘命中会回填内存。
pub struct HybridCacheEngine {
    mem:        LruCache<CacheKey, Arc<Vec<u8>>>,
    disks:      Vec<DiskTier>,
    file_seq:   AtomicU64,
    write_lock: Mutex<()>,
}

impl HybridCacheEngine {
    pub fn open(mem_space_size: usize, disk_spaces: &[DiskSpace]) -> Result<Self> {
        let mut disks = Vec::with_capacity(disk_spaces.len());
        for space in disk_spaces {
            fs::create_dir_all(&space.path).map_err(|e| {
                LakeError::IoError(format!("create disk cache dir {}: {e}", space.path.display()))
            })?;
            disks.push(DiskTier { dir: space.path.clone(), index: LruCache::new(space.size) });
        }
        Ok(Self {
            mem: LruCache::new(mem_space_size),
            disks,
            file_seq: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        })
    }

    fn disk_for(&self, key: &CacheKey) -> Option<&DiskTier> {
        if self.disks.is_empty() {
            return None;
        }
        let h = crc32fast::hash(key.key.as_bytes()) as usize ^ key.offset as usize;
        Some(&self.disks[h % self.disks.len()])
    }

    fn exists(&self, key: &CacheKey) -> bool {
        self.mem.contains(key) || self.disk_for(key).is_some_and(|d| d.index.contains(key))
    }

    fn spill(&self, evicted: Vec<(CacheKey, Arc<Vec<u8>>)>) {
        for (key, block) in evicted {
            if let Err(e) = self.write_disk(&key, &block) {
                warn!(target: "lake", key = %key.key, offset = key.offset, error = %e, "spill block to disk cache failed");
            }
        }
    }

    fn write_disk(&self, key: &CacheKey, data: &[u8]) -> Result<()> {
        let Some(disk) = self.disk_for(key) else { return Ok(()) };
        let seq = self.file_seq.fetch_add(1, Ordering::Relaxed);
        let path = disk.dir.join(format!("{:08x}_{:x}_{seq}.blk", crc32fast::hash(key.key.as_bytes()), key.offset));
        fs::write(&path, data)?;
        if let Some(old) = disk.index.remove(key) {
            DiskTier::remove_files(vec![(key.clone(), old)]);
        }
        let evicted = disk.index.insert(key.clone(), DiskEntry { path: path.clone(), size: data.len(), crc: crc32fast::hash(data) }, data.len());
        if !disk.index.contains(key) {
            // 超过整个磁盘配额
            let _ = fs::remove_file(&path);
        }
        DiskTier::remove_files(evicted);
        debug!(target: "lake", key = %key.key, offset = key.offset, bytes = data.len(), "block spilled to disk cache");
        Ok(())
    }

    fn remove_disk(&self, key: &CacheKey) {
        if let Some(disk) = self.disk_for(key) {
            if let Some(old) = disk.index.remove(key) {
                DiskTier::remove_files(vec![(key.clone(), old)]);
            }
        }
    }
}

impl CacheEngine for HybridCacheEngine {
    fn write(&self, key: &CacheKey, data: &[u8], overwrite: bool) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self.exists(key) {
            if !overwrite {
                return Err(LakeError::AlreadyExists(format!("cache block {}@{}", key.key, key.offset)));
            }
            self.remove_disk(key);
        }
        let evicted = self.mem.insert(key.clone(), Arc::new(data.to_vec()), data.len());
        self.spill(evicted);
        if !self.mem.contains(key) {
            self.write_disk(key, data)?;
        }
        Ok(())
    }

    fn read(&self, key: &CacheKey) -> Result<Vec<u8>> {
        if let Some(block) = self.mem.get(key) {
            return Ok(block.as_ref().clone());
        }
        let not_found = || LakeError::NotFound(format!("cache block {}@{}", key.key, key.offset));
        let disk = self.disk_for(key).ok_or_else(not_found)?;
        let entry = disk.index.get(key).ok_or_else(not_found)?;
        let data = fs::read(&entry.path).map_err(|e| {
            LakeError::IoError(format!("read disk cache file {}: {e}", entry.path.display()))
        })?;
        if data.len() != entry.size || crc32fast::hash(&data) != entry.crc {
            let _guard = self.write_lock.lock();
            self.remove_disk(key);
            return Err(LakeError::Corruption(format!(
                "disk cache file {} does not match its block ({} bytes, expected {})",
                entry.path.display(), data.len(), entry.size
            )));
        }
        let _guard = self.write_lock.lock();
        if disk.index.contains(key) {
            self.remove_disk(key);
            let evicted = self.mem.insert(key.clone(), Arc::new(data.clone()), data.len());
            self.spill(evicted);
            if !self.mem.contains(key) {
                self.write_disk(key, &data)?;
            }
        }
        Ok(data)
    }

    fn remove(&self, key: &CacheKey) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.mem.remove(key);
        self.remove_disk(key);
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        let mem = self.mem.stats();
        let mut stats = CacheStats {
            mem_entries: mem.entries,
            mem_bytes:   mem.size,
            hits:        mem.hits,
            misses:      mem.misses,
            ..Default::default()
        };
        for d in &self.disks {
            let s = d.index.stats();
            stats.disk_entries += s.entries;
            stats.disk_bytes += s.size;
        }
        stats
    }

    fn shutdown(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.mem.clear();
        for d in &self.disks {
            let mut all = Vec::new();
            d.index.remove_if(|_| true);
            for entry in fs::read_dir(&d.dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e == "blk") {
                    all.push(path);
                }
            }
            for p in all {
                let _ = fs::remove_file(p);
            }
        }
        Ok(())
    }
}
