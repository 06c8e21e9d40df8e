//! Meta-file builder / reader
//!
//! `MetaFileBuilder` 在 base metadata 的副本上应用事务日志，收集 delete
//! vector 页，`finalize` 时先写 delvec 文件再写 metadata。metadata 写入使用
//! CreateNew，目标版本已存在时得到 `AlreadyExists`，由发布协调器处理。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::common::{LakeError, Result, RowsetId, Rssid, TxnId, Version};
use crate::delvec::DelVector;
use crate::fs::WriteMode;
use crate::location::delvec_filename;
use crate::meta::{DelvecPage, OpCompaction, OpWrite, TabletMetadata};
use crate::metadata_store::TabletMetadataStore;
use crate::pk_index::PrimaryIndexHandle;
use crate::tablet::Tablet;
use crate::tablet_manager::TabletManager;

// ── Builder ───────────────────────────────────────────────────────────────────

/// 进程内单调序号，与时间戳、pid 混合后作为 delvec 文件名的 nonce
static DELVEC_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_delvec_nonce() -> u64 {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_nanos() as u64);
    let seq = DELVEC_SEQ.fetch_add(1, Ordering::Relaxed);
    nanos ^ (u64::from(std::process::id()) << 40) ^ seq.rotate_left(20)
}

pub struct MetaFileBuilder<'a> {
    tablet:           Tablet<'a>,
    meta:             TabletMetadata,
    /// 待写入 delvec 文件的页
    buf:              Vec<u8>,
    /// rssid → buf 中的 (offset, size)
    delvecs:          BTreeMap<Rssid, (u64, u64)>,
    delvec_nonce:     u64,
    /// 已经写出的 delvec 文件，metadata 写入失败时清理
    delvec_written:   Option<PathBuf>,
    /// 已应用本次写入的主键索引；应用 compaction 后清空
    primary_index:    Option<PrimaryIndexHandle>,
    has_compaction:   bool,
    has_update_index: bool,
    has_finalized:    bool,
    poisoned:         bool,
}

impl<'a> MetaFileBuilder<'a> {
    /// `metadata` 是 base 版本的副本，version 已经加 1
    pub fn new(tablet: Tablet<'a>, metadata: TabletMetadata) -> Self {
        Self {
            tablet,
            meta: metadata,
            buf: Vec::new(),
            delvecs: BTreeMap::new(),
            delvec_nonce: next_delvec_nonce(),
            delvec_written: None,
            primary_index: None,
            has_compaction: false,
            has_update_index: false,
            has_finalized: false,
            poisoned: false,
        }
    }

    pub fn metadata(&self) -> &TabletMetadata { &self.meta }

    /// 返回新 metadata 以及反映它的主键索引（若有）
    pub fn into_parts(self) -> (TabletMetadata, Option<PrimaryIndexHandle>) {
        (self.meta, self.primary_index)
    }

    pub fn has_applied_compaction(&self) -> bool { self.has_compaction }

    pub fn take_primary_index(&mut self) -> Option<PrimaryIndexHandle> { self.primary_index.take() }

    pub fn set_primary_index(&mut self, handle: PrimaryIndexHandle) { self.primary_index = Some(handle); }

    pub fn has_update_index(&self) -> bool { self.has_update_index }

    pub fn set_has_update_index(&mut self) { self.has_update_index = true; }

    pub fn has_finalized(&self) -> bool { self.has_finalized }

    pub fn is_poisoned(&self) -> bool { self.poisoned }

    /// 记录产生本版本的事务与提交时间
    pub fn set_commit_info(&mut self, txn_ids: &[TxnId], commit_time: i64) {
        self.meta.txn_ids = txn_ids.to_vec();
        self.meta.commit_time = commit_time;
    }

    /// 缓冲一个 segment 的 delete vector。空集合直接忽略；同一 segment 再次
    /// 追加时新页替换旧页。
    pub fn append_delvec(&mut self, delvec: &DelVector, rssid: Rssid) -> Result<()> {
        if delvec.is_empty() {
            return Ok(());
        }
        let offset = self.buf.len() as u64;
        delvec.save_to(&mut self.buf)?;
        let size = self.buf.len() as u64 - offset;
        self.delvecs.insert(rssid, (offset, size));
        Ok(())
    }

    /// 追加 rowset 并分配 id；空 rowset 也会消耗一个 id
    pub fn apply_opwrite(&mut self, op_write: &OpWrite) -> RowsetId {
        let mut rowset = op_write.rowset.clone();
        let id = self.meta.next_rowset_id;
        rowset.id = id;
        self.meta.next_rowset_id += rowset.num_segments().max(1) as RowsetId;
        self.meta.rowsets.push(rowset);
        self.has_update_index = true;
        id
    }

    /// 删除输入 rowset 及其 delete vector，追加输出 rowset 并安装 `output_delvec`
    pub fn apply_opcompaction(&mut self, op: &OpCompaction) -> Result<()> {
        if !self.meta.is_primary_key() && !op.output_delvec.is_empty() {
            return Err(LakeError::InvalidArgument(format!(
                "compaction output delvec on non primary key tablet {}", self.meta.id
            )));
        }
        for id in &op.input_rowsets {
            if self.meta.find_rowset(*id).is_none() {
                return Err(LakeError::InvalidArgument(format!(
                    "compaction input rowset {id} not found in tablet {} version {}",
                    self.meta.id, self.meta.version
                )));
            }
        }
        let output_segments = op.output_rowset.as_ref().map_or(0, |r| r.num_segments());
        if let Some(bad) = op.output_delvec.iter().find(|d| d.segment_idx as usize >= output_segments) {
            return Err(LakeError::InvalidArgument(format!(
                "compaction output delvec refers to segment {} of {output_segments}", bad.segment_idx
            )));
        }

        let mut ranges: Vec<(Rssid, Rssid)> = Vec::new();
        self.meta.rowsets.retain(|r| {
            if op.input_rowsets.contains(&r.id) {
                ranges.push((r.id, r.id + r.num_segments() as Rssid));
                false
            } else {
                true
            }
        });
        let in_inputs = |rssid: Rssid| ranges.iter().any(|(lo, hi)| rssid >= *lo && rssid < *hi);
        let before = self.meta.delvec_meta.delvecs.len();
        self.meta.delvec_meta.delvecs.retain(|rssid, _| !in_inputs(*rssid));
        let erased = before - self.meta.delvec_meta.delvecs.len();
        self.delvecs.retain(|rssid, _| !in_inputs(*rssid));

        if let Some(output) = op.output_rowset.as_ref().filter(|r| r.num_segments() > 0) {
            let mut rowset = output.clone();
            let id = self.meta.next_rowset_id;
            rowset.id = id;
            self.meta.next_rowset_id += rowset.num_segments() as RowsetId;
            self.meta.rowsets.push(rowset);
            for d in &op.output_delvec {
                let dv = DelVector::from_rows(self.meta.version, d.deleted_rows.iter().copied());
                self.append_delvec(&dv, id + d.segment_idx)?;
            }
        }
        self.has_update_index = true;
        self.has_compaction = true;
        self.primary_index = None;
        info!(
            target: "lake",
            tablet_id = self.meta.id,
            input_ranges = ?ranges,
            delvec_erased = erased,
            output_segments,
            "apply compaction"
        );
        Ok(())
    }

    /// 读取本次构建中尚未持久化的 delete vector
    pub fn find_delvec(&self, rssid: Rssid) -> Result<Option<DelVector>> {
        match self.delvecs.get(&rssid) {
            Some(&(offset, size)) => {
                let page = &self.buf[offset as usize..(offset + size) as usize];
                DelVector::load(page).map(Some)
            }
            None => Ok(None),
        }
    }

    fn finalize_delvec(&mut self, version: Version) -> Result<()> {
        if !self.meta.is_primary_key() {
            return Ok(());
        }
        let file = delvec_filename(self.meta.id, version, self.delvec_nonce);
        for (rssid, (offset, size)) in std::mem::take(&mut self.delvecs) {
            self.meta.delvec_meta.delvecs.insert(rssid, DelvecPage { file: file.clone(), offset, size, version });
        }
        if self.buf.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let path = self.tablet.delvec_location(&file);
        // nonce 撞车按 IO 错误处理，重试时换一个 builder
        self.tablet.tablet_mgr().file_system()
            .write_atomic(&path, &self.buf, WriteMode::CreateNew)
            .map_err(|e| match e {
                LakeError::AlreadyExists(m) => LakeError::IoError(m),
                other => other,
            })?;
        self.delvec_written = Some(path);
        let cost = start.elapsed().as_millis() as u64;
        if cost > self.tablet.tablet_mgr().config().slow_log_threshold_ms {
            info!(target: "lake", tablet_id = self.meta.id, version, cost_ms = cost, "sync delvec file");
        }
        Ok(())
    }

    /// 写 delvec 文件与 metadata。失败后 builder 不可再用。
    pub fn finalize(&mut self) -> Result<()> {
        if self.poisoned || self.has_finalized {
            return Err(LakeError::Internal(format!(
                "meta file builder of tablet {} already finalized or failed", self.meta.id
            )));
        }
        let start = Instant::now();
        let version = self.meta.version;
        let res = self.finalize_delvec(version).and_then(|_| self.tablet.put_metadata(&self.meta));
        if let Err(e) = res {
            self.poisoned = true;
            // 目标版本属于别的 builder，只清理自己的 delvec 文件
            if let (true, Some(path)) = (e.is_already_exists(), self.delvec_written.take()) {
                if let Err(del) = self.tablet.tablet_mgr().file_system().delete(&path) {
                    warn!(target: "lake", path = %path.display(), error = %del, "remove orphan delvec file");
                }
            }
            return Err(e);
        }
        self.has_finalized = true;
        let cost = start.elapsed().as_millis() as u64;
        if cost > self.tablet.tablet_mgr().config().slow_log_threshold_ms {
            info!(target: "lake", tablet_id = self.meta.id, version, cost_ms = cost, "meta file builder finalize");
        }
        Ok(())
    }

    /// 发布失败且内存索引已被修改时必须调用
    pub fn handle_failure(&self) {
        if self.meta.is_primary_key() && !self.has_finalized && self.has_update_index {
            self.tablet.update_mgr().remove_primary_index_cache(self.meta.id);
        }
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

pub struct MetaFileReader {
    path:       PathBuf,
    fill_cache: bool,
    meta:       Option<Arc<TabletMetadata>>,
}

impl MetaFileReader {
    pub fn new(path: impl AsRef<Path>, fill_cache: bool) -> Self {
        Self { path: path.as_ref().to_path_buf(), fill_cache, meta: None }
    }

    pub fn load(&mut self, tablet_mgr: &TabletManager) -> Result<()> {
        let start = Instant::now();
        let data = self.read_file(tablet_mgr)?;
        let meta = TabletMetadataStore::parse_metadata(&data, &self.path)?;
        self.meta = Some(Arc::new(meta));
        let cost = start.elapsed().as_millis() as u64;
        if cost > tablet_mgr.config().slow_log_threshold_ms {
            info!(target: "lake", path = %self.path.display(), cost_ms = cost, "meta file reader load");
        }
        Ok(())
    }

    fn read_file(&self, tablet_mgr: &TabletManager) -> Result<Vec<u8>> {
        let fs = tablet_mgr.file_system();
        let cache = match tablet_mgr.block_cache() {
            Some(c) if self.fill_cache => c,
            _ => return fs.read_all(&self.path),
        };
        let key = self.path.to_string_lossy();
        let size_key = format!("{key}#size");
        if let Ok(len) = cache.read_cache(&size_key, 0, 8) {
            let mut n = [0u8; 8];
            n.copy_from_slice(&len);
            if let Ok(data) = cache.read_cache(&key, 0, u64::from_le_bytes(n) as usize) {
                return Ok(data);
            }
        }
        let data = fs.read_all(&self.path)?;
        let filled = cache.write_cache(&key, 0, &data, true)
            .and_then(|_| cache.write_cache(&size_key, 0, &(data.len() as u64).to_le_bytes(), true));
        if let Err(e) = filled {
            debug!(target: "lake", path = %self.path.display(), error = %e, "skip filling block cache");
        }
        Ok(data)
    }

    fn loaded(&self) -> Result<&Arc<TabletMetadata>> {
        self.meta.as_ref().ok_or_else(|| LakeError::Internal("meta file reader not loaded".into()))
    }

    /// 返回 segment 的 delete vector；没有删除时返回空集合
    pub fn get_del_vec(&self, tablet_mgr: &TabletManager, rssid: Rssid) -> Result<DelVector> {
        let meta = self.loaded()?;
        match meta.delvec_meta.delvecs.get(&rssid) {
            Some(page) => {
                let dv = tablet_mgr.read_delvec_page(meta.id, page, self.fill_cache)?;
                Ok(dv.as_ref().clone())
            }
            None => {
                debug!(target: "lake", tablet_id = meta.id, rssid, "no delvec for segment");
                Ok(DelVector::default())
            }
        }
    }

    pub fn get_meta(&self) -> Result<Arc<TabletMetadata>> {
        self.loaded().cloned()
    }
}
