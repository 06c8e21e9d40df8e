//! TabletManager：服务定位器 + 发布协调器
//!
//! ```text
//! publish_version(tablet, base, new, txns)
//!   │  tablet 锁（64 分片锁表）
//!   ├─ new 已存在且 txn 一致        → 直接返回 score
//!   ├─ new+1 已存在（重放历史发布）  → 直接返回 score
//!   ├─ new 已存在但 txn 不同        → AlreadyExists
//!   ├─ base 不存在                  → NotFound
//!   └─ 循环（IoError 指数退避重试）
//!        MetaFileBuilder(base 副本, version+1)
//!        逐个 txn：OpWrite → UpdateManager / apply_opwrite
//!                  OpCompaction → apply_opcompaction
//!        finalize（AlreadyExists → 重读比对 rowset）
//!        失败 → handle_failure（失效主键索引）
//!   成功：删除 txn log，推进索引水位
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::block_cache::BlockCache;
use crate::common::{LakeError, Result, TabletId, TxnId, Version};
use crate::config::LakeConfig;
use crate::delvec::DelVector;
use crate::fs::{FileSystem, LocalFileSystem};
use crate::location::LocationProvider;
use crate::lru::{LruCache, LruStats};
use crate::meta::{DelvecPage, RowsetMetadata, TabletMetadata, TxnLog, TxnOp};
use crate::meta_file::MetaFileBuilder;
use crate::metadata_store::TabletMetadataStore;
use crate::pk_index::PrimaryIndexHandle;
use crate::tablet::Tablet;
use crate::update_manager::UpdateManager;

const NUM_LOCK_SHARDS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DelvecCacheKey {
    tablet_id: TabletId,
    page:      DelvecPage,
}

pub struct TabletManager {
    config:         LakeConfig,
    fs:             Arc<dyn FileSystem>,
    location:       Arc<dyn LocationProvider>,
    metadata_store: TabletMetadataStore,
    update_mgr:     UpdateManager,
    delvec_cache:   LruCache<DelvecCacheKey, Arc<DelVector>>,
    block_cache:    Option<Arc<BlockCache>>,
    /// tablet 发布锁，按 tablet_id 分片
    publish_locks:  Vec<Mutex<HashMap<TabletId, Arc<Mutex<()>>>>>,
}

impl TabletManager {
    pub fn new(config: LakeConfig, location: Arc<dyn LocationProvider>, fs: Arc<dyn FileSystem>) -> Self {
        let publish_locks = (0..NUM_LOCK_SHARDS).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            metadata_store: TabletMetadataStore::new(fs.clone(), location.clone(), config.metadata_cache_capacity),
            update_mgr: UpdateManager::new(config.primary_index_cache_capacity),
            delvec_cache: LruCache::new(config.delvec_cache_capacity),
            block_cache: None,
            publish_locks,
            config,
            fs,
            location,
        }
    }

    /// 本地文件系统；配置了 block cache 时一并初始化
    pub fn open(config: LakeConfig, location: Arc<dyn LocationProvider>) -> Result<Self> {
        let block_cache = match &config.block_cache {
            Some(opts) => {
                let cache = BlockCache::new();
                cache.init(opts)?;
                Some(Arc::new(cache))
            }
            None => None,
        };
        let mut mgr = Self::new(config, location, Arc::new(LocalFileSystem::new()));
        mgr.block_cache = block_cache;
        Ok(mgr)
    }

    pub fn with_block_cache(mut self, cache: Arc<BlockCache>) -> Self {
        self.block_cache = Some(cache);
        self
    }

    // ── 访问器 ────────────────────────────────────────────────────────────────

    pub fn config(&self) -> &LakeConfig { &self.config }

    pub fn file_system(&self) -> &dyn FileSystem { self.fs.as_ref() }

    pub fn location_provider(&self) -> &dyn LocationProvider { self.location.as_ref() }

    pub fn update_mgr(&self) -> &UpdateManager { &self.update_mgr }

    pub fn block_cache(&self) -> Option<&BlockCache> { self.block_cache.as_deref() }

    pub fn metadata_cache_stats(&self) -> LruStats { self.metadata_store.cache_stats() }

    pub fn delvec_cache_stats(&self) -> LruStats { self.delvec_cache.stats() }

    /// 不做存在性检查的句柄
    pub fn tablet(&self, tablet_id: TabletId) -> Tablet<'_> {
        Tablet::new(self, tablet_id)
    }

    // ── tablet / metadata ─────────────────────────────────────────────────────

    /// 写入初始版本（必须是 version 1）
    pub fn create_tablet(&self, meta: &TabletMetadata) -> Result<Tablet<'_>> {
        if meta.version != 1 {
            return Err(LakeError::InvalidArgument(format!(
                "initial metadata of tablet {} must be version 1, got {}", meta.id, meta.version
            )));
        }
        self.metadata_store.put_metadata(meta)?;
        info!(target: "lake", tablet_id = meta.id, keys_type = ?meta.schema.keys_type, "tablet created");
        Ok(self.tablet(meta.id))
    }

    pub fn get_tablet(&self, tablet_id: TabletId) -> Result<Tablet<'_>> {
        if !self.metadata_store.metadata_exists(tablet_id, 1)? {
            return Err(LakeError::NotFound(format!("tablet {tablet_id} not found")));
        }
        Ok(self.tablet(tablet_id))
    }

    pub fn get_tablet_metadata(&self, tablet_id: TabletId, version: Version) -> Result<Arc<TabletMetadata>> {
        self.metadata_store.get_metadata(tablet_id, version)
    }

    pub fn put_tablet_metadata(&self, meta: &TabletMetadata) -> Result<()> {
        self.metadata_store.put_metadata(meta)
    }

    pub fn list_tablet_metadata_versions(&self, tablet_id: TabletId) -> Result<Vec<Version>> {
        self.metadata_store.list_metadata_versions(tablet_id)
    }

    pub fn latest_version(&self, tablet_id: TabletId) -> Result<Version> {
        self.list_tablet_metadata_versions(tablet_id)?
            .last()
            .copied()
            .ok_or_else(|| LakeError::NotFound(format!("tablet {tablet_id} has no metadata")))
    }

    pub fn put_txn_log(&self, log: &TxnLog) -> Result<()> {
        self.metadata_store.put_txn_log(log)
    }

    pub fn get_txn_log(&self, tablet_id: TabletId, txn_id: TxnId) -> Result<TxnLog> {
        self.metadata_store.get_txn_log(tablet_id, txn_id)
    }

    pub fn delete_txn_log(&self, tablet_id: TabletId, txn_id: TxnId) -> Result<()> {
        self.metadata_store.delete_txn_log(tablet_id, txn_id)
    }

    pub fn compaction_score(meta: &TabletMetadata) -> f64 {
        meta.compaction_score()
    }

    // ── delete vector ─────────────────────────────────────────────────────────

    fn lookup_delvec(&self, key: &DelvecCacheKey) -> Option<Arc<DelVector>> {
        self.delvec_cache.get(key)
    }

    fn cache_delvec(&self, key: DelvecCacheKey, delvec: Arc<DelVector>) {
        let charge = delvec.rows().serialized_size() + 16;
        self.delvec_cache.insert(key, delvec, charge);
    }

    /// 读一个 delvec 页：先查对象缓存，再（可选）查 block cache，最后读文件
    pub fn read_delvec_page(&self, tablet_id: TabletId, page: &DelvecPage, fill_cache: bool) -> Result<Arc<DelVector>> {
        let key = DelvecCacheKey { tablet_id, page: page.clone() };
        if let Some(dv) = self.lookup_delvec(&key) {
            return Ok(dv);
        }
        let start = Instant::now();
        let path = self.location.delvec_file_location(tablet_id, &page.file);
        let cache_key = path.to_string_lossy().into_owned();
        let block_cache = self.block_cache().filter(|_| fill_cache);
        let cached = block_cache.and_then(|c| c.read_cache(&cache_key, page.offset, page.size as usize).ok());
        let bytes = match cached {
            Some(b) => b,
            None => {
                let b = self.fs.read_at(&path, page.offset, page.size as usize)?;
                if let Some(c) = block_cache {
                    if let Err(e) = c.write_cache(&cache_key, page.offset, &b, true) {
                        debug!(target: "lake", path = %path.display(), error = %e, "skip filling block cache");
                    }
                }
                b
            }
        };
        let dv = DelVector::load(&bytes)?;
        if dv.version() != page.version {
            return Err(LakeError::Corruption(format!(
                "delvec page {}@{} has version {}, metadata says {}", page.file, page.offset, dv.version(), page.version
            )));
        }
        let dv = Arc::new(dv);
        self.cache_delvec(key, dv.clone());
        let cost = start.elapsed().as_millis() as u64;
        if cost > self.config.slow_log_threshold_ms {
            info!(target: "lake", tablet_id, file = %page.file, cost_ms = cost, "read delvec");
        }
        Ok(dv)
    }

    // ── 发布 ──────────────────────────────────────────────────────────────────

    fn lock_shard(&self, tablet_id: TabletId) -> &Mutex<HashMap<TabletId, Arc<Mutex<()>>>> {
        &self.publish_locks[(tablet_id as u64 as usize) % NUM_LOCK_SHARDS]
    }

    fn publish_lock(&self, tablet_id: TabletId) -> Arc<Mutex<()>> {
        self.lock_shard(tablet_id).lock().entry(tablet_id).or_default().clone()
    }

    /// 归还 tablet 锁；没有其他发布在等待时删除表项
    fn release_publish_lock(&self, tablet_id: TabletId, lock: Arc<Mutex<()>>) {
        let mut shard = self.lock_shard(tablet_id).lock();
        // 表中一份加上 `lock` 一份
        if Arc::strong_count(&lock) == 2 {
            shard.remove(&tablet_id);
        }
    }

    /// 把 `txn_ids` 应用到 `base_version`，生成 `new_version`，返回 compaction score
    pub fn publish_version(
        &self,
        tablet_id:    TabletId,
        base_version: Version,
        new_version:  Version,
        txn_ids:      &[TxnId],
    ) -> Result<f64> {
        if new_version != base_version + 1 {
            return Err(LakeError::InvalidArgument(format!(
                "new version {new_version} does not follow base version {base_version}"
            )));
        }
        if txn_ids.is_empty() {
            return Err(LakeError::InvalidArgument("publish without transactions".into()));
        }
        let lock = self.publish_lock(tablet_id);
        let res = {
            let _guard = lock.lock();
            self.publish_locked(tablet_id, base_version, new_version, txn_ids)
        };
        self.release_publish_lock(tablet_id, lock);
        res
    }

    fn publish_locked(
        &self,
        tablet_id:    TabletId,
        base_version: Version,
        new_version:  Version,
        txn_ids:      &[TxnId],
    ) -> Result<f64> {
        match self.metadata_store.get_metadata(tablet_id, new_version) {
            Ok(existing) => return self.resolve_existing(&existing, txn_ids),
            Err(LakeError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let base = self.metadata_store.get_metadata(tablet_id, base_version).map_err(|e| match e {
            LakeError::NotFound(_) => LakeError::NotFound(format!(
                "tablet {tablet_id} base version {base_version} does not exist"
            )),
            other => other,
        })?;

        let tablet = self.tablet(tablet_id);
        let mut attempt = 0u32;
        let (published, index) = loop {
            match self.publish_once(&tablet, &base, txn_ids) {
                Ok(done) => break done,
                Err(e) if e.is_retryable() && attempt < self.config.publish_max_retries => {
                    let backoff = self.config.publish_retry_backoff_ms.saturating_mul(1 << attempt.min(16));
                    attempt += 1;
                    warn!(target: "lake", tablet_id, base_version, attempt, backoff_ms = backoff, error = %e, "publish failed, retrying");
                    std::thread::sleep(Duration::from_millis(backoff));
                }
                Err(e) => {
                    warn!(target: "lake", tablet_id, base_version, new_version, error = %e, "publish failed");
                    return Err(e);
                }
            }
        };

        for txn_id in txn_ids {
            if let Err(e) = self.metadata_store.delete_txn_log(tablet_id, *txn_id) {
                warn!(target: "lake", tablet_id, txn_id, error = %e, "delete txn log failed");
            }
        }
        if published.is_primary_key() {
            self.update_mgr.update_primary_index_data_version(tablet_id, index, base_version, new_version);
        }
        let score = published.compaction_score();
        info!(target: "lake", tablet_id, base_version, new_version, txns = ?txn_ids, score, "publish version");
        Ok(score)
    }

    /// 目标版本已存在：txn 一致或已有更新版本都视为成功
    fn resolve_existing(&self, existing: &TabletMetadata, txn_ids: &[TxnId]) -> Result<f64> {
        if existing.txn_ids == txn_ids {
            debug!(target: "lake", tablet_id = existing.id, version = existing.version, "version already published");
            return Ok(existing.compaction_score());
        }
        if self.metadata_store.metadata_exists(existing.id, existing.version + 1)? {
            debug!(target: "lake", tablet_id = existing.id, version = existing.version, "replay of historical publish");
            return Ok(existing.compaction_score());
        }
        Err(LakeError::AlreadyExists(format!(
            "tablet {} version {} was published by txns {:?}, not {:?}",
            existing.id, existing.version, existing.txn_ids, txn_ids
        )))
    }

    /// 成功时一并返回已应用本次写入的主键索引句柄
    fn publish_once(
        &self,
        tablet:  &Tablet<'_>,
        base:    &TabletMetadata,
        txn_ids: &[TxnId],
    ) -> Result<(TabletMetadata, Option<PrimaryIndexHandle>)> {
        let mut next = base.clone();
        next.version = base.version + 1;
        let mut builder = MetaFileBuilder::new(*tablet, next);
        let commit_time = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs() as i64);
        builder.set_commit_info(txn_ids, commit_time);

        let res = self.apply_txn_logs(tablet, &mut builder, base.version, txn_ids)
            .and_then(|_| builder.finalize());
        match res {
            Ok(()) => Ok(builder.into_parts()),
            Err(e) => {
                builder.handle_failure();
                if e.is_already_exists() {
                    return self.resolve_conflict(builder.metadata(), e).map(|meta| (meta, None));
                }
                Err(e)
            }
        }
    }

    fn apply_txn_logs(
        &self,
        tablet:       &Tablet<'_>,
        builder:      &mut MetaFileBuilder<'_>,
        base_version: Version,
        txn_ids:      &[TxnId],
    ) -> Result<()> {
        let is_pk = builder.metadata().is_primary_key();
        for &txn_id in txn_ids {
            let log = tablet.get_txn_log(txn_id)?;
            match &log.op {
                TxnOp::Write(op) if is_pk => {
                    self.update_mgr.publish_primary_key_tablet(op, txn_id, tablet, builder, base_version)?;
                }
                TxnOp::Write(op) => {
                    builder.apply_opwrite(op);
                }
                TxnOp::Compaction(op) if is_pk => {
                    self.update_mgr.publish_primary_compaction(op, txn_id, tablet, builder, base_version)?;
                }
                TxnOp::Compaction(op) => builder.apply_opcompaction(op)?,
            }
        }
        Ok(())
    }

    /// finalize 遇到已存在的版本：内容一致（rowset 集合相同）视为成功
    fn resolve_conflict(&self, intended: &TabletMetadata, err: LakeError) -> Result<TabletMetadata> {
        let existing = self.metadata_store.get_metadata(intended.id, intended.version)?;
        let same_segments = |a: &[RowsetMetadata], b: &[RowsetMetadata]| {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.segments == y.segments && x.num_rows == y.num_rows)
        };
        if same_segments(&existing.rowsets, &intended.rowsets) {
            info!(target: "lake", tablet_id = intended.id, version = intended.version, "concurrent publish produced the same version");
            self.update_mgr.remove_primary_index_cache(intended.id);
            return Ok(existing.as_ref().clone());
        }
        Err(err)
    }
}
