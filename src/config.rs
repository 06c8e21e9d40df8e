//! 存储引擎配置
//!
//! 所有字段都有默认值，可以从 TOML 读取；配置对象显式传给 `TabletManager`，
//! 不存在进程级全局配置。

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::common::{LakeError, Result};
use crate::field_type::CompressionType;

fn default_metadata_cache_capacity() -> usize { 64 * 1024 * 1024 }
fn default_delvec_cache_capacity() -> usize { 16 * 1024 * 1024 }
fn default_primary_index_cache_capacity() -> usize { 256 * 1024 * 1024 }
fn default_publish_max_retries() -> u32 { 3 }
fn default_publish_retry_backoff_ms() -> u64 { 50 }
fn default_max_rows_per_segment() -> usize { 1_000_000 }
fn default_slow_log_threshold_ms() -> u64 { 100 }
fn default_block_size() -> usize { 1024 * 1024 }
fn default_cache_engine() -> String { "hybrid".to_string() }

#[derive(Debug, Clone, Deserialize)]
pub struct LakeConfig {
    /// metadata 快照 LRU 容量（字节）
    #[serde(default = "default_metadata_cache_capacity")]
    pub metadata_cache_capacity:      usize,
    #[serde(default = "default_delvec_cache_capacity")]
    pub delvec_cache_capacity:        usize,
    /// 超过此容量后淘汰无人引用的主键索引
    #[serde(default = "default_primary_index_cache_capacity")]
    pub primary_index_cache_capacity: usize,
    #[serde(default = "default_publish_max_retries")]
    pub publish_max_retries:          u32,
    #[serde(default = "default_publish_retry_backoff_ms")]
    pub publish_retry_backoff_ms:     u64,
    #[serde(default = "default_max_rows_per_segment")]
    pub max_rows_per_segment:         usize,
    #[serde(default)]
    pub segment_compression:          CompressionType,
    #[serde(default = "default_slow_log_threshold_ms")]
    pub slow_log_threshold_ms:        u64,
    #[serde(default)]
    pub block_cache:                  Option<BlockCacheOptions>,
}

impl Default for LakeConfig {
    fn default() -> Self {
        Self {
            metadata_cache_capacity:      default_metadata_cache_capacity(),
            delvec_cache_capacity:        default_delvec_cache_capacity(),
            primary_index_cache_capacity: default_primary_index_cache_capacity(),
            publish_max_retries:          default_publish_max_retries(),
            publish_retry_backoff_ms:     default_publish_retry_backoff_ms(),
            max_rows_per_segment:         default_max_rows_per_segment(),
            segment_compression:          CompressionType::default(),
            slow_log_threshold_ms:        default_slow_log_threshold_ms(),
            block_cache:                  None,
        }
    }
}

impl LakeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| LakeError::InvalidArgument(format!("parse lake config: {e}")))
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| LakeError::IoError(format!("read config file {}: {e}", path.display())))?;
        Self::from_toml_str(&s)
    }
}

// ── Block cache 配置 ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct DiskSpace {
    pub path: PathBuf,
    /// 该目录的配额（字节）
    pub size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockCacheOptions {
    #[serde(default)]
    pub mem_space_size: usize,
    #[serde(default)]
    pub disk_spaces:    Vec<DiskSpace>,
    #[serde(default = "default_block_size")]
    pub block_size:     usize,
    /// "memory" 或 "hybrid"
    #[serde(default = "default_cache_engine")]
    pub engine:         String,
}

impl Default for BlockCacheOptions {
    fn default() -> Self {
        Self {
            mem_space_size: 0,
            disk_spaces:    Vec::new(),
            block_size:     default_block_size(),
            engine:         default_cache_engine(),
        }
    }
}
