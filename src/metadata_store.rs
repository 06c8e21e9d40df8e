//! Tablet metadata 与事务日志的持久化
//!
//! 文件格式：`magic(8) | crc32(u32 LE) | len(u32 LE) | json payload`

use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::common::{LakeError, Result, TabletId, TxnId, Version};
use crate::fs::{FileSystem, WriteMode};
use crate::location::{parse_metadata_filename, LocationProvider};
use crate::lru::{LruCache, LruStats};
use crate::meta::{TabletMetadata, TxnLog};

const METADATA_MAGIC: &[u8; 8] = b"LAKEMETA";
const TXN_LOG_MAGIC:  &[u8; 8] = b"LAKETXNL";
const FRAME_HEADER:   usize    = 16;

fn encode_frame(magic: &[u8; 8], payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; FRAME_HEADER];
    out[..8].copy_from_slice(magic);
    LittleEndian::write_u32(&mut out[8..12], crc32fast::hash(payload));
    LittleEndian::write_u32(&mut out[12..16], payload.len() as u32);
    out.extend_from_slice(payload);
    out
}

fn decode_frame<'a>(magic: &[u8; 8], data: &'a [u8], path: &Path) -> Result<&'a [u8]> {
    if data.len() < FRAME_HEADER || &data[..8] != magic {
        return Err(LakeError::Corruption(format!("bad file header: {}", path.display())));
    }
    let crc = LittleEndian::read_u32(&data[8..12]);
    let len = LittleEndian::read_u32(&data[12..16]) as usize;
    let payload = &data[FRAME_HEADER..];
    if payload.len() != len {
        return Err(LakeError::Corruption(format!(
            "truncated file {}: expected {len} bytes, found {}", path.display(), payload.len()
        )));
    }
    if crc32fast::hash(payload) != crc {
        return Err(LakeError::Corruption(format!("checksum mismatch: {}", path.display())));
    }
    Ok(payload)
}

pub struct TabletMetadataStore {
    fs:       Arc<dyn FileSystem>,
    location: Arc<dyn LocationProvider>,
    cache:    LruCache<(TabletId, Version), Arc<TabletMetadata>>,
}

impl TabletMetadataStore {
    pub fn new(
        fs:             Arc<dyn FileSystem>,
        location:       Arc<dyn LocationProvider>,
        cache_capacity: usize,
    ) -> Self {
        Self { fs, location, cache: LruCache::new(cache_capacity) }
    }

    // ── metadata ──────────────────────────────────────────────────────────────

    /// 原子写入 `<root>/meta/<tablet>_<version>`；版本已存在时返回 `AlreadyExists`
    pub fn put_metadata(&self, meta: &TabletMetadata) -> Result<()> {
        if meta.version < 1 {
            return Err(LakeError::InvalidArgument(format!("invalid metadata version {}", meta.version)));
        }
        let payload = serde_json::to_vec(meta)
            .map_err(|e| LakeError::Internal(format!("serialize tablet metadata: {e}")))?;
        let path = self.location.metadata_location(meta.id, meta.version);
        let bytes = encode_frame(METADATA_MAGIC, &payload);
        self.fs.write_atomic(&path, &bytes, WriteMode::CreateNew)?;
        debug!(target: "lake", tablet_id = meta.id, version = meta.version, bytes = bytes.len(), "put tablet metadata");
        self.cache.insert((meta.id, meta.version), Arc::new(meta.clone()), bytes.len());
        Ok(())
    }

    pub fn get_metadata(&self, tablet_id: TabletId, version: Version) -> Result<Arc<TabletMetadata>> {
        if let Some(m) = self.cache.get(&(tablet_id, version)) {
            return Ok(m);
        }
        let path = self.location.metadata_location(tablet_id, version);
        let data = self.fs.read_all(&path).map_err(|e| match e {
            LakeError::NotFound(_) => LakeError::NotFound(format!(
                "tablet metadata not found: tablet_id={tablet_id} version={version}"
            )),
            other => other,
        })?;
        let meta = Arc::new(Self::parse_metadata(&data, &path)?);
        if meta.id != tablet_id || meta.version != version {
            return Err(LakeError::Corruption(format!(
                "metadata file {} holds tablet {} version {}", path.display(), meta.id, meta.version
            )));
        }
        self.cache.insert((tablet_id, version), meta.clone(), data.len());
        Ok(meta)
    }

    pub(crate) fn parse_metadata(data: &[u8], path: &Path) -> Result<TabletMetadata> {
        let payload = decode_frame(METADATA_MAGIC, data, path)?;
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn metadata_exists(&self, tablet_id: TabletId, version: Version) -> Result<bool> {
        if self.cache.contains(&(tablet_id, version)) {
            return Ok(true);
        }
        self.fs.exists(&self.location.metadata_location(tablet_id, version))
    }

    /// 扫描 meta 目录，返回升序的版本列表
    pub fn list_metadata_versions(&self, tablet_id: TabletId) -> Result<Vec<Version>> {
        let names = self.fs.list(&self.location.metadata_root(tablet_id))?;
        let mut versions: Vec<Version> = names.iter()
            .filter_map(|n| parse_metadata_filename(n))
            .filter(|(t, _)| *t == tablet_id)
            .map(|(_, v)| v)
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// 删除一个版本（保留策略由外部决定）
    pub fn delete_metadata(&self, tablet_id: TabletId, version: Version) -> Result<()> {
        self.cache.remove(&(tablet_id, version));
        self.fs.delete(&self.location.metadata_location(tablet_id, version))
    }

    pub fn cache_stats(&self) -> LruStats { self.cache.stats() }

    // ── txn log ───────────────────────────────────────────────────────────────

    pub fn put_txn_log(&self, log: &TxnLog) -> Result<()> {
        let payload = serde_json::to_vec(log)
            .map_err(|e| LakeError::Internal(format!("serialize txn log: {e}")))?;
        let path = self.location.txn_log_location(log.tablet_id, log.txn_id);
        self.fs.write_atomic(&path, &encode_frame(TXN_LOG_MAGIC, &payload), WriteMode::Overwrite)?;
        debug!(target: "lake", tablet_id = log.tablet_id, txn_id = log.txn_id, "put txn log");
        Ok(())
    }

    pub fn get_txn_log(&self, tablet_id: TabletId, txn_id: TxnId) -> Result<TxnLog> {
        let path = self.location.txn_log_location(tablet_id, txn_id);
        let data = self.fs.read_all(&path).map_err(|e| match e {
            LakeError::NotFound(_) => LakeError::NotFound(format!(
                "txn log not found: tablet_id={tablet_id} txn_id={txn_id}"
            )),
            other => other,
        })?;
        let log: TxnLog = serde_json::from_slice(decode_frame(TXN_LOG_MAGIC, &data, &path)?)?;
        if log.tablet_id != tablet_id || log.txn_id != txn_id {
            return Err(LakeError::Corruption(format!(
                "txn log {} holds tablet {} txn {}", path.display(), log.tablet_id, log.txn_id
            )));
        }
        Ok(log)
    }

    /// 删除事务日志；日志已不存在视为成功
    pub fn delete_txn_log(&self, tablet_id: TabletId, txn_id: TxnId) -> Result<()> {
        match self.fs.delete(&self.location.txn_log_location(tablet_id, txn_id)) {
            Ok(()) | Err(LakeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
