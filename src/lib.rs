//! # lake-storage-engine
//!
//! 共享存储（lake）模式下的 tablet 存储层：tablet 状态由不可变的版本化
//! metadata 快照加上只追加的事务日志表示，全部保存在共享对象存储中。
//!
//! ## 整体架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        TabletManager                         │
//! │  publish_version() ── 64 分片 tablet 锁 ── 重试 / 冲突处理     │
//! │      │                                                       │
//! │      ├─ MetaFileBuilder   apply_opwrite / apply_opcompaction │
//! │      │     └─ finalize: delvec 文件 → metadata（CreateNew）    │
//! │      ├─ UpdateManager     主键 upsert → delete vector        │
//! │      │     └─ PrimaryIndexCache  key → (rssid, row_id)       │
//! │      ├─ TabletMetadataStore  meta/ + log/（LRU 缓存）         │
//! │      ├─ delvec 对象缓存 + BlockCache（内存 / 磁盘两级）        │
//! │      └─ LocationProvider → FileSystem（原子写）               │
//! │                                                              │
//! │  DeltaWriter ── TabletWriter ── Segment（列存文件）            │
//! │  TabletReader ── Segment − DelVector                          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

// ── 基础 ──────────────────────────────────────────────────────────────────────
pub mod common;
pub mod config;
pub mod lru;

// ── 存储访问 ──────────────────────────────────────────────────────────────────
pub mod fs;
pub mod location;
pub mod block_cache;
pub mod metadata_store;

// ── 数据格式 ──────────────────────────────────────────────────────────────────
pub mod field_type;
pub mod compression;
pub mod page;
pub mod segment;
pub mod chunk;
pub mod delvec;
pub mod meta;

// ── 发布路径 ──────────────────────────────────────────────────────────────────
pub mod pk_index;
pub mod meta_file;
pub mod update_manager;
pub mod tablet;
pub mod tablet_manager;
pub mod tablet_writer;
pub mod tablet_reader;
pub mod delta_writer;

pub use common::{LakeError, Result};
pub use config::LakeConfig;
pub use tablet_manager::TabletManager;
