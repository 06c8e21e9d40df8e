//! Segment 列的物理字段类型、运行时值与主键编码

use serde::{Deserialize, Serialize};

use crate::common::{ColumnType, LakeError, Result};

/// 列在 Segment 文件中的存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int8, Int16, Int32, Int64,
    Float32, Float64,
    /// 变长字节（Varchar / String）
    Bytes,
    /// 日期存储为 i32（天数）
    Date,
}

impl From<ColumnType> for FieldType {
    fn from(ct: ColumnType) -> Self {
        match ct {
            ColumnType::Int8    => Self::Int8,
            ColumnType::Int16   => Self::Int16,
            ColumnType::Int32   => Self::Int32,
            ColumnType::Int64   => Self::Int64,
            ColumnType::Float32 => Self::Float32,
            ColumnType::Float64 => Self::Float64,
            ColumnType::Varchar => Self::Bytes,
            ColumnType::Date    => Self::Date,
        }
    }
}

impl FieldType {
    /// 固定字节宽度；变长类型返回 None
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Int8               => Some(1),
            Self::Int16              => Some(2),
            Self::Int32 | Self::Date => Some(4),
            Self::Int64              => Some(8),
            Self::Float32            => Some(4),
            Self::Float64            => Some(8),
            Self::Bytes              => None,
        }
    }

    pub(crate) fn to_tag(self) -> u8 {
        match self {
            Self::Int8    => 1,
            Self::Int16   => 2,
            Self::Int32   => 3,
            Self::Int64   => 4,
            Self::Float32 => 5,
            Self::Float64 => 6,
            Self::Bytes   => 7,
            Self::Date    => 8,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => Self::Int8,
            2 => Self::Int16,
            3 => Self::Int32,
            4 => Self::Int64,
            5 => Self::Float32,
            6 => Self::Float64,
            7 => Self::Bytes,
            8 => Self::Date,
            _ => return Err(LakeError::Corruption(format!("unknown field type tag {tag}"))),
        })
    }
}

/// 压缩方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    #[default]
    Lz4,
}

/// 列值（运行时表示）
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Bytes(Vec<u8>),
    Date(i32),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(v)  => Some(*v as i64),
            Self::Int16(v) => Some(*v as i64),
            Self::Int32(v) => Some(*v as i64),
            Self::Int64(v) => Some(*v),
            Self::Date(v)  => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int32(v) | Self::Date(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self { Self::Bytes(b) => Some(b), _ => None }
    }

    pub fn is_null(&self) -> bool { matches!(self, Self::Null) }

    /// 值是否可以存入给定类型的列
    pub fn matches(&self, ft: FieldType) -> bool {
        matches!(
            (self, ft),
            (Self::Null, _)
                | (Self::Int8(_), FieldType::Int8)
                | (Self::Int16(_), FieldType::Int16)
                | (Self::Int32(_), FieldType::Int32)
                | (Self::Int64(_), FieldType::Int64)
                | (Self::Float32(_), FieldType::Float32)
                | (Self::Float64(_), FieldType::Float64)
                | (Self::Bytes(_), FieldType::Bytes)
                | (Self::Date(_), FieldType::Date)
        )
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null       => write!(f, "NULL"),
            Self::Int8(v)    => write!(f, "{v}"),
            Self::Int16(v)   => write!(f, "{v}"),
            Self::Int32(v)   => write!(f, "{v}"),
            Self::Int64(v)   => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Bytes(b)   => write!(f, "{}", String::from_utf8_lossy(b)),
            Self::Date(v)    => write!(f, "date({v})"),
        }
    }
}

// ── 主键编码 ──────────────────────────────────────────────────────────────────
//
// 编码结果按字节序比较与按值比较一致：
//   • 整数：符号位取反后大端
//   • 字节串：0x00 转义为 0x00 0x01，非末列以 0x00 0x00 结尾

const SLICE_ESCAPE_BYTE:   u8 = 0x00;
const SLICE_ESCAPE_SUFFIX: u8 = 0x01;

/// 将一行的主键列编码为索引 key
pub fn encode_primary_key(keys: &[&Value]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(keys.len() * 8);
    let last = keys.len().saturating_sub(1);
    for (i, v) in keys.iter().enumerate() {
        match v {
            Value::Null     => {
                return Err(LakeError::InvalidArgument("primary key column must not be null".into()))
            }
            Value::Int8(x)  => out.push((*x as u8) ^ 0x80),
            Value::Int16(x) => out.extend_from_slice(&((*x as u16) ^ 0x8000).to_be_bytes()),
            Value::Int32(x) | Value::Date(x) => {
                out.extend_from_slice(&((*x as u32) ^ 0x8000_0000).to_be_bytes())
            }
            Value::Int64(x) => {
                out.extend_from_slice(&((*x as u64) ^ 0x8000_0000_0000_0000).to_be_bytes())
            }
            Value::Bytes(b) => {
                if i == last {
                    out.extend_from_slice(b);
                } else {
                    for &byte in b {
                        out.push(byte);
                        if byte == SLICE_ESCAPE_BYTE {
                            out.push(SLICE_ESCAPE_SUFFIX);
                        }
                    }
                    out.push(SLICE_ESCAPE_BYTE);
                    out.push(SLICE_ESCAPE_BYTE);
                }
            }
            Value::Float32(_) | Value::Float64(_) => {
                return Err(LakeError::InvalidArgument(
                    "floating point primary key columns are not supported".into(),
                ))
            }
        }
    }
    Ok(out)
}
