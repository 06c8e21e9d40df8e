//! 两级块缓存（内存 + 本地磁盘）
//!
//! `BlockCache` 本身只是一个生命周期外壳：`init` 按配置选择引擎，
//! `shutdown` 释放内存与磁盘占用。缓存以 `(key, offset)` 为单位，
//! 单个条目不超过 `block_size`。
//!
//! ```text
//! write_cache ──▶ memory LRU ──(evict)──▶ disk tier（按配额 LRU，淘汰即删文件）
//! read_cache  ──▶ memory LRU ──(miss)───▶ disk tier ──▶ 回填 memory
//! ```

mod hybrid;
mod memory;

use parking_lot::RwLock;
use tracing::info;

use crate::common::{LakeError, Result};
use crate::config::BlockCacheOptions;

pub use hybrid::HybridCacheEngine;
pub use memory::MemoryCacheEngine;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub key:    String,
    pub offset: u64,
}

impl CacheKey {
    pub fn new(key: &str, offset: u64) -> Self {
        Self { key: key.to_string(), offset }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub mem_entries:  usize,
    pub mem_bytes:    usize,
    pub disk_entries: usize,
    pub disk_bytes:   usize,
    pub hits:         u64,
    pub misses:       u64,
}

/// 缓存引擎
pub trait CacheEngine: Send + Sync {
    /// 条目已存在且 `overwrite == false` 时返回 `AlreadyExists`
    fn write(&self, key: &CacheKey, data: &[u8], overwrite: bool) -> Result<()>;

    /// 未命中返回 `NotFound`
    fn read(&self, key: &CacheKey) -> Result<Vec<u8>>;

    fn remove(&self, key: &CacheKey) -> Result<()>;

    fn stats(&self) -> CacheStats;

    fn shutdown(&self) -> Result<()>;
}

struct Inner {
    engine:     Box<dyn CacheEngine>,
    block_size: usize,
}

#[derive(Default)]
pub struct BlockCache {
    inner: RwLock<Option<Inner>>,
}

impl BlockCache {
    pub fn new() -> Self { Self::default() }

    /// 按配置创建引擎。磁盘目录不存在时自动创建。
    pub fn init(&self, options: &BlockCacheOptions) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.is_some() {
            return Err(LakeError::AlreadyExists("block cache is already initialized".into()));
        }
        if options.block_size == 0 {
            return Err(LakeError::InvalidArgument("block cache block_size must be positive".into()));
        }
        let engine: Box<dyn CacheEngine> = match options.engine.as_str() {
            "memory" => Box::new(MemoryCacheEngine::new(options.mem_space_size)),
            "hybrid" => Box::new(HybridCacheEngine::open(options.mem_space_size, &options.disk_spaces)?),
            other => {
                return Err(LakeError::InvalidArgument(format!("unknown block cache engine: {other}")));
            }
        };
        info!(
            target: "lake",
            engine = %options.engine,
            mem_space_size = options.mem_space_size,
            disk_spaces = options.disk_spaces.len(),
            block_size = options.block_size,
            "block cache initialized"
        );
        *inner = Some(Inner { engine, block_size: options.block_size });
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.read().is_some()
    }

    /// 释放引擎；之后可以重新 `init`
    pub fn shutdown(&self) -> Result<()> {
        match self.inner.write().take() {
            Some(inner) => {
                inner.engine.shutdown()?;
                info!(target: "lake", "block cache shut down");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn block_size(&self) -> Option<usize> {
        self.inner.read().as_ref().map(|i| i.block_size)
    }

    pub fn write_cache(&self, key: &str, offset: u64, data: &[u8], overwrite: bool) -> Result<()> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or_else(not_initialized)?;
        if data.len() > inner.block_size {
            return Err(LakeError::InvalidArgument(format!(
                "cache value of {} bytes exceeds block size {}", data.len(), inner.block_size
            )));
        }
        inner.engine.write(&CacheKey::new(key, offset), data, overwrite)
    }

    /// 读取 `(key, offset)` 处的前 `len` 个字节
    pub fn read_cache(&self, key: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or_else(not_initialized)?;
        let mut data = inner.engine.read(&CacheKey::new(key, offset))?;
        if data.len() < len {
            return Err(LakeError::NotFound(format!(
                "cached block {key}@{offset} holds {} bytes, {len} requested", data.len()
            )));
        }
        data.truncate(len);
        Ok(data)
    }

    pub fn remove_cache(&self, key: &str, offset: u64, _len: usize) -> Result<()> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or_else(not_initialized)?;
        inner.engine.remove(&CacheKey::new(key, offset))
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.read().as_ref().map(|i| i.engine.stats()).unwrap_or_default()
    }
}

fn not_initialized() -> LakeError {
    LakeError::Internal("block cache is not initialized".into())
}
