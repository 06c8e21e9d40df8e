//! Tablet 句柄
//!
//! `Tablet` 只是 `(tablet_id, &TabletManager)` 的组合，不持有任何状态；
//! 所有持久化状态都在 metadata 快照与事务日志里。

use std::path::PathBuf;
use std::sync::Arc;

use crate::common::{Result, Rssid, TabletId, TxnId, Version};
use crate::delvec::DelVector;
use crate::meta::{TabletMetadata, TxnLog};
use crate::segment::SegmentReader;
use crate::tablet_manager::TabletManager;
use crate::tablet_reader::TabletReader;
use crate::tablet_writer::TabletWriter;
use crate::update_manager::UpdateManager;

#[derive(Clone, Copy)]
pub struct Tablet<'a> {
    id:  TabletId,
    mgr: &'a TabletManager,
}

impl std::fmt::Debug for Tablet<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tablet").field("id", &self.id).finish_non_exhaustive()
    }
}

impl<'a> Tablet<'a> {
    pub(crate) fn new(mgr: &'a TabletManager, id: TabletId) -> Self {
        Self { id, mgr }
    }

    pub fn id(&self) -> TabletId { self.id }

    pub fn tablet_mgr(&self) -> &'a TabletManager { self.mgr }

    pub fn update_mgr(&self) -> &'a UpdateManager { self.mgr.update_mgr() }

    // ── metadata / txn log ────────────────────────────────────────────────────

    pub fn get_metadata(&self, version: Version) -> Result<Arc<TabletMetadata>> {
        self.mgr.get_tablet_metadata(self.id, version)
    }

    pub fn put_metadata(&self, meta: &TabletMetadata) -> Result<()> {
        self.mgr.put_tablet_metadata(meta)
    }

    pub fn list_metadata_versions(&self) -> Result<Vec<Version>> {
        self.mgr.list_tablet_metadata_versions(self.id)
    }

    pub fn latest_version(&self) -> Result<Version> {
        self.mgr.latest_version(self.id)
    }

    pub fn get_txn_log(&self, txn_id: TxnId) -> Result<TxnLog> {
        self.mgr.get_txn_log(self.id, txn_id)
    }

    pub fn put_txn_log(&self, log: &TxnLog) -> Result<()> {
        self.mgr.put_txn_log(log)
    }

    pub fn delete_txn_log(&self, txn_id: TxnId) -> Result<()> {
        self.mgr.delete_txn_log(self.id, txn_id)
    }

    // ── 路径 ──────────────────────────────────────────────────────────────────

    pub fn root_location(&self) -> PathBuf {
        self.mgr.location_provider().root_location(self.id)
    }

    pub fn metadata_location(&self, version: Version) -> PathBuf {
        self.mgr.location_provider().metadata_location(self.id, version)
    }

    pub fn txn_log_location(&self, txn_id: TxnId) -> PathBuf {
        self.mgr.location_provider().txn_log_location(self.id, txn_id)
    }

    /// page 中记录的 delvec 文件名 → 完整路径
    pub fn delvec_location(&self, file: &str) -> PathBuf {
        self.mgr.location_provider().delvec_file_location(self.id, file)
    }

    pub fn segment_location(&self, segment_name: &str) -> PathBuf {
        self.mgr.location_provider().segment_location(self.id, segment_name)
    }

    // ── 数据 ──────────────────────────────────────────────────────────────────

    /// `meta` 中记录的 segment delete vector；没有删除时返回 None
    pub fn get_del_vec(&self, meta: &TabletMetadata, rssid: Rssid) -> Result<Option<Arc<DelVector>>> {
        match meta.delvec_meta.delvecs.get(&rssid) {
            Some(page) => self.mgr.read_delvec_page(self.id, page, false).map(Some),
            None => Ok(None),
        }
    }

    pub fn read_segment(&self, segment_name: &str) -> Result<SegmentReader> {
        let data = self.mgr.file_system().read_all(&self.segment_location(segment_name))?;
        SegmentReader::open(data)
    }

    pub fn new_writer(&self, txn_id: TxnId) -> Result<TabletWriter<'a>> {
        TabletWriter::new(*self, txn_id)
    }

    pub fn new_reader(&self, version: Version) -> TabletReader<'a> {
        TabletReader::new(*self, version)
    }
}
