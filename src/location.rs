//! tablet id → 存储路径映射
//!
//! ```text
//! <root>/meta/<tablet>_<version>.meta     tablet metadata
//! <root>/meta/<tablet>_<version>.delvec   delete vector 页文件
//! <root>/log/<tablet>_<txn>.log           事务日志
//! <root>/data/<segment>                   segment 文件
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::common::{Result, TabletId, TxnId, Version};

pub const METADATA_DIR: &str = "meta";
pub const TXN_LOG_DIR:  &str = "log";
pub const SEGMENT_DIR:  &str = "data";

pub fn metadata_filename(tablet_id: TabletId, version: Version) -> String {
    format!("{:016X}_{:016X}.meta", tablet_id, version)
}

pub fn txn_log_filename(tablet_id: TabletId, txn_id: TxnId) -> String {
    format!("{:016X}_{:016X}.log", tablet_id, txn_id)
}

/// 每个 builder 使用自己的 `nonce`，同一版本的并发构建不会写到同一个文件
pub fn delvec_filename(tablet_id: TabletId, version: Version, nonce: u64) -> String {
    format!("{:016X}_{:016X}_{:016X}.delvec", tablet_id, version, nonce)
}

/// 解析 metadata 文件名，返回 (tablet_id, version)
pub fn parse_metadata_filename(name: &str) -> Option<(TabletId, Version)> {
    let stem = name.strip_suffix(".meta")?;
    let (t, v) = stem.split_once('_')?;
    let tablet_id = u64::from_str_radix(t, 16).ok()? as i64;
    let version = u64::from_str_radix(v, 16).ok()? as i64;
    Some((tablet_id, version))
}

pub trait LocationProvider: Send + Sync {
    fn owned_tablets(&self) -> BTreeSet<TabletId>;

    fn root_location(&self, tablet_id: TabletId) -> PathBuf;

    fn list_root_locations(&self) -> Result<BTreeSet<PathBuf>>;

    fn metadata_root(&self, tablet_id: TabletId) -> PathBuf {
        self.root_location(tablet_id).join(METADATA_DIR)
    }

    fn txn_log_root(&self, tablet_id: TabletId) -> PathBuf {
        self.root_location(tablet_id).join(TXN_LOG_DIR)
    }

    fn segment_root(&self, tablet_id: TabletId) -> PathBuf {
        self.root_location(tablet_id).join(SEGMENT_DIR)
    }

    fn metadata_location(&self, tablet_id: TabletId, version: Version) -> PathBuf {
        self.metadata_root(tablet_id).join(metadata_filename(tablet_id, version))
    }

    fn txn_log_location(&self, tablet_id: TabletId, txn_id: TxnId) -> PathBuf {
        self.txn_log_root(tablet_id).join(txn_log_filename(tablet_id, txn_id))
    }

    /// page 中记录的 delvec 文件名 → 完整路径
    fn delvec_file_location(&self, tablet_id: TabletId, file: &str) -> PathBuf {
        self.metadata_root(tablet_id).join(file)
    }

    fn segment_location(&self, tablet_id: TabletId, segment_name: &str) -> PathBuf {
        self.segment_root(tablet_id).join(segment_name)
    }
}

/// 所有 tablet 共用一个根目录
pub struct FixedLocationProvider {
    root:          PathBuf,
    owned_tablets: RwLock<BTreeSet<TabletId>>,
}

impl FixedLocationProvider {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf(), owned_tablets: RwLock::new(BTreeSet::new()) }
    }

    pub fn add_owned_tablet(&self, tablet_id: TabletId) {
        self.owned_tablets.write().insert(tablet_id);
    }

    pub fn remove_owned_tablet(&self, tablet_id: TabletId) {
        self.owned_tablets.write().remove(&tablet_id);
    }
}

impl LocationProvider for FixedLocationProvider {
    fn owned_tablets(&self) -> BTreeSet<TabletId> {
        self.owned_tablets.read().clone()
    }

    fn root_location(&self, _tablet_id: TabletId) -> PathBuf {
        self.root.clone()
    }

    fn list_root_locations(&self) -> Result<BTreeSet<PathBuf>> {
        Ok(BTreeSet::from([self.root.clone()]))
    }
}
