//! 主键表发布状态：索引加载、覆盖写检测与 delete vector 生成

use std::collections::BTreeMap;
use std::time::Instant;

use roaring::RoaringBitmap;
use tracing::{debug, info, warn};

use crate::common::{LakeError, Result, Rssid, RowId, TabletId, TxnId, Version};
use crate::field_type::{encode_primary_key, Value};
use crate::meta::{OpCompaction, OpWrite, TabletMetadata, TabletSchema};
use crate::meta_file::MetaFileBuilder;
use crate::pk_index::{PrimaryIndex, PrimaryIndexCache, PrimaryIndexHandle, RowLocation};
use crate::tablet::Tablet;

/// 读出 segment 中每一行的编码主键
pub(crate) fn segment_primary_keys(tablet: &Tablet<'_>, schema: &TabletSchema, segment: &str) -> Result<Vec<Vec<u8>>> {
    let reader = tablet.read_segment(segment)?;
    let key_idx = schema.key_column_indexes();
    if key_idx.is_empty() {
        return Err(LakeError::InvalidArgument(format!("tablet {} schema has no key column", tablet.id())));
    }
    let columns = key_idx.iter().map(|&i| reader.read_column(i)).collect::<Result<Vec<_>>>()?;
    let mut keys = Vec::with_capacity(reader.num_rows() as usize);
    for row in 0..reader.num_rows() as usize {
        let values: Vec<&Value> = columns.iter().map(|c| &c[row]).collect();
        keys.push(encode_primary_key(&values)?);
    }
    Ok(keys)
}

pub struct UpdateManager {
    index_cache: PrimaryIndexCache,
}

impl UpdateManager {
    pub fn new(index_cache_capacity: usize) -> Self {
        Self { index_cache: PrimaryIndexCache::new(index_cache_capacity) }
    }

    pub fn index_cache(&self) -> &PrimaryIndexCache { &self.index_cache }

    /// 把 `meta` 的全部存活行灌入空索引。`pending` 为进行中的 builder 时，
    /// 优先使用其中尚未持久化的 delete vector。
    fn scan_live_rows(
        tablet:  &Tablet<'_>,
        index:   &mut PrimaryIndex,
        meta:    &TabletMetadata,
        pending: Option<&MetaFileBuilder<'_>>,
    ) -> Result<()> {
        for rowset in &meta.rowsets {
            for (i, segment) in rowset.segments.iter().enumerate() {
                let rssid = rowset.segment_rssid(i);
                let keys = segment_primary_keys(tablet, &meta.schema, segment)?;
                let delvec = match pending.map(|b| b.find_delvec(rssid)).transpose()?.flatten() {
                    Some(dv) => Some(dv),
                    None => tablet.get_del_vec(meta, rssid)?.map(|d| d.as_ref().clone()),
                };
                for (row_id, key) in keys.into_iter().enumerate() {
                    let row_id = row_id as RowId;
                    if delvec.as_ref().is_some_and(|d| d.contains(row_id)) {
                        continue;
                    }
                    if let Some(old) = index.upsert(key, RowLocation::new(rssid, row_id)) {
                        index.reset();
                        return Err(LakeError::Corruption(format!(
                            "tablet {} version {}: duplicate live key at rssid {} row {} and rssid {rssid} row {row_id}",
                            tablet.id(), meta.version, old.rssid, old.row_id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// 用 `version` 的全部存活行重建索引
    fn load_index(&self, tablet: &Tablet<'_>, index: &mut PrimaryIndex, version: Version) -> Result<()> {
        let start = Instant::now();
        index.reset();
        let meta = tablet.get_metadata(version)?;
        Self::scan_live_rows(tablet, index, &meta, None)?;
        index.mark_loaded(version);
        info!(
            target: "lake",
            tablet_id = tablet.id(),
            version,
            keys = index.len(),
            memory = index.memory_usage(),
            cost_ms = start.elapsed().as_millis() as u64,
            "primary index loaded"
        );
        Ok(())
    }

    /// 返回水位恰好为 `version` 的索引，必要时重新加载
    pub fn get_or_load_index(&self, tablet: &Tablet<'_>, version: Version) -> Result<PrimaryIndexHandle> {
        let handle = self.index_cache.get_or_create(tablet.id());
        {
            let mut index = handle.lock();
            if !index.is_loaded() || index.watermark() != version {
                if index.is_loaded() {
                    debug!(target: "lake", tablet_id = tablet.id(), watermark = index.watermark(), version, "reload primary index");
                }
                self.load_index(tablet, &mut index, version)?;
            }
        }
        Ok(handle)
    }

    /// 同一次发布中 compaction 之后的写入：索引按 builder 当前状态重建，
    /// 水位记为 base，发布成功后再推进
    fn rebuild_index_from_builder(
        &self,
        tablet:       &Tablet<'_>,
        builder:      &MetaFileBuilder<'_>,
        base_version: Version,
    ) -> Result<PrimaryIndexHandle> {
        let start = Instant::now();
        let handle = self.index_cache.get_or_create(tablet.id());
        {
            let mut index = handle.lock();
            index.reset();
            Self::scan_live_rows(tablet, &mut index, builder.metadata(), Some(builder))?;
            index.mark_loaded(base_version);
            info!(
                target: "lake",
                tablet_id = tablet.id(),
                base_version,
                keys = index.len(),
                cost_ms = start.elapsed().as_millis() as u64,
                "primary index rebuilt after compaction"
            );
        }
        Ok(handle)
    }

    /// delta writer 结束时预热索引；不覆盖已加载的索引
    pub fn preload_primary_key_index(&self, tablet: &Tablet<'_>) -> Result<()> {
        let handle = self.index_cache.get_or_create(tablet.id());
        let mut index = handle.lock();
        if index.is_loaded() {
            return Ok(());
        }
        let version = tablet.latest_version()?;
        self.load_index(tablet, &mut index, version)
    }

    /// 应用一个写事务：upsert 新行，为被覆盖的旧行生成 delete vector，
    /// 最后把 rowset 追加到 builder
    pub fn publish_primary_key_tablet(
        &self,
        op_write:     &OpWrite,
        txn_id:       TxnId,
        tablet:       &Tablet<'_>,
        builder:      &mut MetaFileBuilder<'_>,
        base_version: Version,
    ) -> Result<()> {
        let start = Instant::now();
        let handle = match builder.take_primary_index() {
            Some(h) => h,
            None if builder.has_applied_compaction() => self.rebuild_index_from_builder(tablet, builder, base_version)?,
            None => self.get_or_load_index(tablet, base_version)?,
        };
        let rowset_id = builder.metadata().next_rowset_id;
        let num_segments = op_write.rowset.num_segments() as Rssid;
        let schema = builder.metadata().schema.clone();
        let mut deletes: BTreeMap<Rssid, RoaringBitmap> = BTreeMap::new();
        let mut upserts = 0usize;

        builder.set_has_update_index();
        {
            let mut index = handle.lock();
            for (i, segment) in op_write.rowset.segments.iter().enumerate() {
                let rssid = rowset_id + i as Rssid;
                let keys = segment_primary_keys(tablet, &schema, segment)?;
                for (row_id, key) in keys.into_iter().enumerate() {
                    upserts += 1;
                    if let Some(old) = index.upsert(key, RowLocation::new(rssid, row_id as RowId)) {
                        let in_new_rowset = old.rssid >= rowset_id && old.rssid < rowset_id + num_segments;
                        if !in_new_rowset && builder.metadata().find_segment(old.rssid).is_none() {
                            return Err(LakeError::Corruption(format!(
                                "tablet {} txn {txn_id}: primary index points to unknown rssid {}",
                                tablet.id(), old.rssid
                            )));
                        }
                        deletes.entry(old.rssid).or_default().insert(old.row_id);
                    }
                }
            }
        }

        let version = builder.metadata().version;
        let mut deleted_rows = 0u64;
        for (rssid, rows) in deletes {
            deleted_rows += rows.len();
            let mut merged = match builder.find_delvec(rssid)? {
                Some(pending) => pending,
                None => tablet.get_del_vec(builder.metadata(), rssid)?
                    .map(|d| d.as_ref().clone())
                    .unwrap_or_default(),
            };
            merged.union_with(&rows);
            merged.set_version(version);
            builder.append_delvec(&merged, rssid)?;
        }
        builder.apply_opwrite(op_write);
        builder.set_primary_index(handle);

        debug!(
            target: "lake",
            tablet_id = tablet.id(),
            txn_id,
            base_version,
            rowset_id,
            upserts,
            deleted_rows,
            cost_ms = start.elapsed().as_millis() as u64,
            "publish primary key write"
        );
        Ok(())
    }

    /// 应用 compaction。行位置整体变化，索引直接失效，下次发布重新加载。
    pub fn publish_primary_compaction(
        &self,
        op:           &OpCompaction,
        txn_id:       TxnId,
        tablet:       &Tablet<'_>,
        builder:      &mut MetaFileBuilder<'_>,
        base_version: Version,
    ) -> Result<()> {
        builder.apply_opcompaction(op)?;
        self.remove_primary_index_cache(tablet.id());
        info!(
            target: "lake",
            tablet_id = tablet.id(),
            txn_id,
            base_version,
            inputs = ?op.input_rowsets,
            "publish primary key compaction"
        );
        Ok(())
    }

    pub fn remove_primary_index_cache(&self, tablet_id: TabletId) {
        self.index_cache.invalidate(tablet_id);
    }

    /// 发布成功后推进水位。`index` 是本次发布应用过写入的索引；没有
    /// （只有 compaction）、已游离或水位不等于 base 时，缓存里的索引不代表
    /// 新版本，直接丢弃。
    pub fn update_primary_index_data_version(
        &self,
        tablet_id:    TabletId,
        index:        Option<PrimaryIndexHandle>,
        base_version: Version,
        new_version:  Version,
    ) {
        let advanced = match index {
            Some(handle) if !handle.is_invalidated() => {
                let mut guard = handle.lock();
                if guard.is_loaded() && guard.watermark() == base_version {
                    guard.set_watermark(new_version);
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        if !advanced && self.index_cache.invalidate(tablet_id) {
            warn!(target: "lake", tablet_id, base_version, new_version, "primary index does not match published version");
        }
        self.index_cache.evict_if_needed();
    }

    /// 引用计数检查，供测试与诊断使用
    pub fn primary_index_ref_count(&self, tablet_id: TabletId) -> Option<usize> {
        self.index_cache.ref_count(tablet_id)
    }
}
