//! Tablet 持久化元数据与事务日志

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::{
    AggregateType, ColumnType, KeysType, PartitionId, Rssid, RowId, RowsetId, TabletId, TxnId,
    Version,
};
use crate::field_type::FieldType;

// ── 列定义 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub unique_id:      u32,
    pub name:           String,
    pub column_type:    ColumnType,
    pub is_key:         bool,
    pub is_nullable:    bool,
    pub aggregate_type: AggregateType,
    /// VARCHAR 最大字节长度
    pub length:         u32,
}

impl ColumnSchema {
    /// 构建 key 列
    pub fn key(id: u32, name: &str, column_type: ColumnType) -> Self {
        Self {
            unique_id: id, name: name.into(),
            column_type, is_key: true, is_nullable: false,
            aggregate_type: AggregateType::None, length: 0,
        }
    }
    /// 构建 value 列
    pub fn value(id: u32, name: &str, column_type: ColumnType, agg: AggregateType) -> Self {
        Self {
            unique_id: id, name: name.into(),
            column_type, is_key: false, is_nullable: false,
            aggregate_type: agg, length: 0,
        }
    }
    /// 构建 VARCHAR 列
    pub fn varchar(id: u32, name: &str, max_len: u32, is_key: bool) -> Self {
        Self {
            unique_id: id, name: name.into(),
            column_type: ColumnType::Varchar,
            is_key, is_nullable: !is_key,
            aggregate_type: AggregateType::None, length: max_len,
        }
    }
    pub fn nullable(mut self) -> Self {
        self.is_nullable = true; self
    }
}

// ── Tablet Schema ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletSchema {
    pub id:                     i64,
    pub keys_type:              KeysType,
    pub columns:                Vec<ColumnSchema>,
    pub num_short_key_columns:  u32,
    pub num_rows_per_row_block: u32,
}

impl TabletSchema {
    pub fn new(id: i64, keys_type: KeysType, columns: Vec<ColumnSchema>) -> Self {
        let num_short_key_columns = columns.iter().filter(|c| c.is_key).count() as u32;
        Self {
            id, keys_type, columns,
            num_short_key_columns,
            num_rows_per_row_block: 65535,
        }
    }

    pub fn key_columns(&self) -> impl Iterator<Item = &ColumnSchema> {
        self.columns.iter().filter(|c| c.is_key)
    }
    /// key 列在 schema 中的下标
    pub fn key_column_indexes(&self) -> Vec<usize> {
        self.columns.iter().enumerate().filter(|(_, c)| c.is_key).map(|(i, _)| i).collect()
    }
    pub fn field_types(&self) -> Vec<FieldType> {
        self.columns.iter().map(|c| FieldType::from(c.column_type)).collect()
    }
    pub fn num_columns(&self) -> usize { self.columns.len() }
    pub fn is_primary_key(&self) -> bool { self.keys_type == KeysType::PrimaryKeys }
}

// ── Rowset 元数据 ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RowsetMetadata {
    /// 发布时由 builder 分配；txn log 中的值会被忽略
    pub id:         RowsetId,
    /// Segment 文件名（相对 tablet 数据目录）
    pub segments:   Vec<String>,
    pub num_rows:   u64,
    pub data_size:  u64,
    /// segment 之间 key 范围是否重叠
    pub overlapped: bool,
}

impl RowsetMetadata {
    pub fn num_segments(&self) -> usize { self.segments.len() }

    /// 第 `idx` 个 segment 的 rssid
    pub fn segment_rssid(&self, idx: usize) -> Rssid {
        self.id + idx as Rssid
    }

    pub fn contains_rssid(&self, rssid: Rssid) -> bool {
        rssid >= self.id && ((rssid - self.id) as usize) < self.segments.len()
    }
}

// ── Delete vector 页描述 ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DelvecPage {
    /// delvec 文件名（位于 tablet 的 meta 目录下）
    pub file:    String,
    pub offset:  u64,
    pub size:    u64,
    /// 第一次观察到该删除集合的 metadata 版本
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DelvecMetadata {
    /// rssid → page
    pub delvecs: BTreeMap<Rssid, DelvecPage>,
}

// ── Tablet 元数据 ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletMetadata {
    pub id:             TabletId,
    pub version:        Version,
    pub schema:         TabletSchema,
    pub next_rowset_id: RowsetId,
    pub rowsets:        Vec<RowsetMetadata>,
    #[serde(default)]
    pub delvec_meta:    DelvecMetadata,
    /// 产生该版本的事务
    #[serde(default)]
    pub txn_ids:        Vec<TxnId>,
    /// 发布时间（unix 秒）
    #[serde(default)]
    pub commit_time:    i64,
}

impl TabletMetadata {
    /// 新建 tablet 的初始版本（version 1，无 rowset）
    pub fn new(id: TabletId, schema: TabletSchema) -> Self {
        Self {
            id, version: 1, schema,
            next_rowset_id: 1,
            rowsets: Vec::new(),
            delvec_meta: DelvecMetadata::default(),
            txn_ids: Vec::new(),
            commit_time: 0,
        }
    }

    pub fn is_primary_key(&self) -> bool { self.schema.is_primary_key() }

    /// 所有 rowset 行数之和（未扣除 delete vector）
    pub fn num_rows(&self) -> u64 {
        self.rowsets.iter().map(|r| r.num_rows).sum()
    }

    pub fn find_rowset(&self, id: RowsetId) -> Option<&RowsetMetadata> {
        self.rowsets.iter().find(|r| r.id == id)
    }

    /// 找出 rssid 所在的 rowset 与 segment 文件名
    pub fn find_segment(&self, rssid: Rssid) -> Option<(&RowsetMetadata, &str)> {
        self.rowsets.iter()
            .find(|r| r.contains_rssid(rssid))
            .map(|r| (r, r.segments[(rssid - r.id) as usize].as_str()))
    }

    /// Compaction 优先级得分：重叠 rowset 按 segment 数计，其余每个 rowset 计 1
    pub fn compaction_score(&self) -> f64 {
        self.rowsets.iter()
            .map(|r| if r.overlapped { r.num_segments().max(1) as f64 } else { 1.0 })
            .sum()
    }
}

// ── 事务日志 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RowsetTxnMeta {
    pub partition_id: PartitionId,
    /// 写入完成时间（unix 秒）
    pub write_time:   i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpWrite {
    pub rowset:          RowsetMetadata,
    #[serde(default)]
    pub rowset_txn_meta: Option<RowsetTxnMeta>,
}

/// compaction 输出 rowset 中某个 segment 的删除行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDelvec {
    pub segment_idx:  u32,
    pub deleted_rows: Vec<RowId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpCompaction {
    pub input_rowsets: Vec<RowsetId>,
    pub output_rowset: Option<RowsetMetadata>,
    #[serde(default)]
    pub output_delvec: Vec<OutputDelvec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnOp {
    Write(OpWrite),
    Compaction(OpCompaction),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnLog {
    pub tablet_id: TabletId,
    pub txn_id:    TxnId,
    pub op:        TxnOp,
}
