//! 主键索引缓存
//!
//! 每个主键 tablet 在进程内最多一个索引条目：`encoded key → (rssid, row_id)`
//! 以及水位版本（索引已完整反映的最高 metadata 版本）。
//!
//! 引用计数约定：
//! - 条目进入缓存时计数为 1（缓存自身持有）
//! - 每个 `PrimaryIndexHandle` 存活期间 +1，`Drop` 时 -1
//! - `invalidate` 从缓存移除并释放缓存那一份引用
//!
//! 因此没有任何操作进行中时，缓存内条目的计数恰好为 1，只有这样的条目
//! 才会在内存压力下被淘汰。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::common::{RowId, Rssid, TabletId, Version};

/// 每个 key 的固定开销估算（HashMap 槽 + Vec 头 + RowLocation）
const ENTRY_OVERHEAD: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowLocation {
    pub rssid:  Rssid,
    pub row_id: RowId,
}

impl RowLocation {
    pub fn new(rssid: Rssid, row_id: RowId) -> Self { Self { rssid, row_id } }
}

// ── 索引本体 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct PrimaryIndex {
    map:          HashMap<Vec<u8>, RowLocation>,
    watermark:    Version,
    loaded:       bool,
    memory_usage: usize,
}

impl PrimaryIndex {
    pub fn is_loaded(&self) -> bool { self.loaded }

    pub fn watermark(&self) -> Version { self.watermark }

    pub fn len(&self) -> usize { self.map.len() }

    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    pub fn memory_usage(&self) -> usize { self.memory_usage }

    pub fn get(&self, key: &[u8]) -> Option<RowLocation> {
        self.map.get(key).copied()
    }

    /// 插入或替换，返回被替换的旧位置
    pub fn upsert(&mut self, key: Vec<u8>, loc: RowLocation) -> Option<RowLocation> {
        let charge = key.len() + ENTRY_OVERHEAD;
        let old = self.map.insert(key, loc);
        if old.is_none() {
            self.memory_usage += charge;
        }
        old
    }

    pub fn erase(&mut self, key: &[u8]) -> Option<RowLocation> {
        let old = self.map.remove(key)?;
        self.memory_usage -= key.len() + ENTRY_OVERHEAD;
        Some(old)
    }

    /// 清空并标记为未加载
    pub fn reset(&mut self) {
        self.map.clear();
        self.memory_usage = 0;
        self.watermark = 0;
        self.loaded = false;
    }

    /// 全量加载完成后调用
    pub fn mark_loaded(&mut self, version: Version) {
        self.loaded = true;
        self.watermark = version;
    }

    /// 发布成功后推进水位
    pub fn set_watermark(&mut self, version: Version) {
        self.watermark = version;
    }
}

// ── 缓存条目与句柄 ────────────────────────────────────────────────────────────

struct IndexEntry {
    tablet_id:   TabletId,
    index:       Mutex<PrimaryIndex>,
    refs:        AtomicUsize,
    invalidated: AtomicBool,
}

/// 持有期间条目不会被淘汰；离开作用域自动 unref
pub struct PrimaryIndexHandle {
    entry: Arc<IndexEntry>,
}

impl PrimaryIndexHandle {
    pub fn tablet_id(&self) -> TabletId { self.entry.tablet_id }

    /// 对同一 tablet 的修改由发布协调器的 tablet 锁串行化，这里的锁保护预加载等只读路径
    pub fn lock(&self) -> MutexGuard<'_, PrimaryIndex> {
        self.entry.index.lock()
    }

    /// 条目已被 invalidate（持有的是游离副本）
    pub fn is_invalidated(&self) -> bool {
        self.entry.invalidated.load(Ordering::Acquire)
    }

    pub fn ref_count(&self) -> usize {
        self.entry.refs.load(Ordering::Acquire)
    }
}

impl Drop for PrimaryIndexHandle {
    fn drop(&mut self) {
        self.entry.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

// ── 缓存 ──────────────────────────────────────────────────────────────────────

pub struct PrimaryIndexCache {
    entries:  Mutex<HashMap<TabletId, Arc<IndexEntry>>>,
    capacity: usize,
}

impl PrimaryIndexCache {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Mutex::new(HashMap::new()), capacity }
    }

    fn acquire(entry: &Arc<IndexEntry>) -> PrimaryIndexHandle {
        entry.refs.fetch_add(1, Ordering::AcqRel);
        PrimaryIndexHandle { entry: entry.clone() }
    }

    /// 取出条目；不存在时创建一个未加载的空条目
    pub fn get_or_create(&self, tablet_id: TabletId) -> PrimaryIndexHandle {
        let mut entries = self.entries.lock();
        let entry = entries.entry(tablet_id).or_insert_with(|| {
            debug!(target: "lake", tablet_id, "create primary index cache entry");
            Arc::new(IndexEntry {
                tablet_id,
                index:       Mutex::new(PrimaryIndex::default()),
                refs:        AtomicUsize::new(1),
                invalidated: AtomicBool::new(false),
            })
        });
        Self::acquire(entry)
    }

    pub fn get(&self, tablet_id: TabletId) -> Option<PrimaryIndexHandle> {
        self.entries.lock().get(&tablet_id).map(Self::acquire)
    }

    /// 丢弃条目，下次访问从持久化状态重新加载
    pub fn invalidate(&self, tablet_id: TabletId) -> bool {
        match self.entries.lock().remove(&tablet_id) {
            Some(entry) => {
                entry.invalidated.store(true, Ordering::Release);
                entry.refs.fetch_sub(1, Ordering::AcqRel);
                info!(target: "lake", tablet_id, "primary index invalidated");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, tablet_id: TabletId) -> bool {
        self.entries.lock().contains_key(&tablet_id)
    }

    /// 缓存中条目的当前引用计数
    pub fn ref_count(&self, tablet_id: TabletId) -> Option<usize> {
        self.entries.lock().get(&tablet_id).map(|e| e.refs.load(Ordering::Acquire))
    }

    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }

    /// 所有未被锁定条目的内存估算之和
    pub fn memory_usage(&self) -> usize {
        self.entries.lock().values()
            .filter_map(|e| e.index.try_lock().map(|i| i.memory_usage()))
            .sum()
    }

    /// 超过容量时淘汰只被缓存自身引用的条目，返回淘汰数量
    pub fn evict_if_needed(&self) -> usize {
        let mut entries = self.entries.lock();
        let mut usage: Vec<(TabletId, usize)> = entries.iter()
            .filter_map(|(id, e)| e.index.try_lock().map(|i| (*id, i.memory_usage())))
            .collect();
        let mut total: usize = usage.iter().map(|(_, m)| m).sum();
        if total <= self.capacity {
            return 0;
        }
        // 先淘汰大的
        usage.sort_by(|a, b| b.1.cmp(&a.1));
        let mut evicted = 0;
        for (tablet_id, mem) in usage {
            if total <= self.capacity {
                break;
            }
            let idle = entries.get(&tablet_id).is_some_and(|e| e.refs.load(Ordering::Acquire) == 1);
            if idle {
                if let Some(e) = entries.remove(&tablet_id) {
                    e.invalidated.store(true, Ordering::Release);
                    e.refs.fetch_sub(1, Ordering::AcqRel);
                }
                total -= mem;
                evicted += 1;
                debug!(target: "lake", tablet_id, memory = mem, "evict primary index");
            }
        }
        evicted
    }
}
