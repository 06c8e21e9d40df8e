//! 全局基础类型与错误定义

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── ID 类型别名 ───────────────────────────────────────────────────────────────

pub type TabletId    = i64;
pub type TxnId       = i64;
pub type Version     = i64;
pub type PartitionId = i64;
pub type RowsetId    = u32;
/// rowset 内 segment 的全局编号：`rowset_id + segment 下标`
pub type Rssid       = u32;
pub type RowId       = u32;

// ── 枚举 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeysType {
    /// 主键模型：相同主键只保留最新一行，旧行通过 delete vector 删除
    PrimaryKeys,
    /// 聚合模型：value 列有 SUM/MAX/MIN 等聚合函数
    AggKeys,
    /// 明细模型：保留所有行
    DupKeys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int8, Int16, Int32, Int64,
    Float32, Float64,
    Varchar,
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateType {
    None, Sum, Max, Min, Replace,
}

// ── 错误 ──────────────────────────────────────────────────────────────────────

/// 对外暴露的错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    NotFound,
    AlreadyExists,
    IoError,
    Corruption,
    InvalidArgument,
    InternalError,
}

#[derive(Debug, Error)]
pub enum LakeError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl LakeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_)        => ErrorCode::NotFound,
            Self::AlreadyExists(_)   => ErrorCode::AlreadyExists,
            Self::IoError(_)         => ErrorCode::IoError,
            Self::Corruption(_)      => ErrorCode::Corruption,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Internal(_)        => ErrorCode::InternalError,
        }
    }

    /// 只有瞬时 I/O 错误值得重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::IoError(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }
}

impl From<std::io::Error> for LakeError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound      => Self::NotFound(e.to_string()),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(e.to_string()),
            _                                 => Self::IoError(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for LakeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Corruption(format!("malformed json payload: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, LakeError>;
