//! Data Page 读写
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ value_count  (u32 LE)            │
//! │ first_row_id (u32 LE)            │
//! │ uncomp_size  (u32 LE)            │
//! │ codec        (u8)                │
//! │ has_nulls    (u8)                │
//! │ payload      (compressed)        │  [null map] + plain values
//! │ CRC32        (u32 LE)            │
//! └──────────────────────────────────┘
//! ```

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::common::{LakeError, Result};
use crate::compression;
use crate::field_type::{CompressionType, FieldType, Value};

/// 每页最多容纳的行数
pub const PAGE_MAX_ROWS: usize = 1024;

const PAGE_HEADER_SIZE: usize = 14;

// ── PageBuilder ───────────────────────────────────────────────────────────────

pub struct PageBuilder {
    pub first_row_id: u32,
    field_type:       FieldType,
    compression:      CompressionType,
    values:           Vec<Value>,
}

impl PageBuilder {
    pub fn new(
        first_row_id: u32,
        field_type:   FieldType,
        compression:  CompressionType,
    ) -> Self {
        Self { first_row_id, field_type, compression, values: Vec::new() }
    }

    pub fn add(&mut self, v: Value) -> Result<()> {
        if !v.matches(self.field_type) {
            return Err(LakeError::InvalidArgument(format!(
                "value {v:?} does not match column type {:?}", self.field_type
            )));
        }
        self.values.push(v);
        Ok(())
    }

    pub fn len(&self)      -> usize { self.values.len() }
    pub fn is_empty(&self) -> bool  { self.values.is_empty() }
    pub fn is_full(&self)  -> bool  { self.values.len() >= PAGE_MAX_ROWS }

    /// 序列化为页字节（encode → compress → 加 header+CRC）
    pub fn build(self) -> Result<Vec<u8>> {
        let has_nulls = self.values.iter().any(Value::is_null);
        let mut body = Vec::new();
        if has_nulls {
            body.extend(self.values.iter().map(|v| v.is_null() as u8));
        }
        for v in &self.values {
            encode_plain(&mut body, v, self.field_type);
        }

        let compressed = compression::compress(&body, self.compression)?;

        let mut page = Vec::with_capacity(PAGE_HEADER_SIZE + compressed.len() + 4);
        page.write_u32::<LittleEndian>(self.values.len() as u32)?;
        page.write_u32::<LittleEndian>(self.first_row_id)?;
        page.write_u32::<LittleEndian>(body.len() as u32)?;
        page.push(compression::codec_to_tag(self.compression));
        page.push(has_nulls as u8);
        page.extend_from_slice(&compressed);

        let crc = crc32fast::hash(&page);
        page.write_u32::<LittleEndian>(crc)?;
        Ok(page)
    }
}

fn encode_plain(out: &mut Vec<u8>, v: &Value, ft: FieldType) {
    match (v, ft) {
        (Value::Int8(x), _)    => out.push(*x as u8),
        (Value::Int16(x), _)   => out.extend_from_slice(&x.to_le_bytes()),
        (Value::Int32(x), _)   => out.extend_from_slice(&x.to_le_bytes()),
        (Value::Date(x), _)    => out.extend_from_slice(&x.to_le_bytes()),
        (Value::Int64(x), _)   => out.extend_from_slice(&x.to_le_bytes()),
        (Value::Float32(x), _) => out.extend_from_slice(&x.to_le_bytes()),
        (Value::Float64(x), _) => out.extend_from_slice(&x.to_le_bytes()),
        (Value::Bytes(b), _)   => {
            out.extend_from_slice(&(b.len() as u32).to_le_bytes());
            out.extend_from_slice(b);
        }
        // null 占位：定长类型写零，变长写长度 0
        (Value::Null, ft) => match ft.fixed_size() {
            Some(n) => out.extend(std::iter::repeat(0u8).take(n)),
            None    => out.extend_from_slice(&0u32.to_le_bytes()),
        },
    }
}

fn decode_plain(cur: &mut Cursor<&[u8]>, ft: FieldType) -> std::io::Result<Value> {
    Ok(match ft {
        FieldType::Int8    => Value::Int8(cur.read_i8()?),
        FieldType::Int16   => Value::Int16(cur.read_i16::<LittleEndian>()?),
        FieldType::Int32   => Value::Int32(cur.read_i32::<LittleEndian>()?),
        FieldType::Date    => Value::Date(cur.read_i32::<LittleEndian>()?),
        FieldType::Int64   => Value::Int64(cur.read_i64::<LittleEndian>()?),
        FieldType::Float32 => Value::Float32(cur.read_f32::<LittleEndian>()?),
        FieldType::Float64 => Value::Float64(cur.read_f64::<LittleEndian>()?),
        FieldType::Bytes   => {
            let len = cur.read_u32::<LittleEndian>()? as usize;
            let mut buf = vec![0u8; len];
            cur.read_exact(&mut buf)?;
            Value::Bytes(buf)
        }
    })
}

// ── PageDecoder ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PageDecoder {
    pub value_count:  usize,
    pub first_row_id: u32,
    pub values:       Vec<Value>,
}

impl PageDecoder {
    pub fn decode(data: &[u8], field_type: FieldType) -> Result<Self> {
        if data.len() < PAGE_HEADER_SIZE + 4 {
            return Err(LakeError::Corruption("page data too short".into()));
        }
        let payload_end = data.len() - 4;
        let stored_crc  = u32::from_le_bytes([
            data[payload_end], data[payload_end + 1], data[payload_end + 2], data[payload_end + 3],
        ]);
        if stored_crc != crc32fast::hash(&data[..payload_end]) {
            return Err(LakeError::Corruption("page checksum mismatch".into()));
        }

        let mut header   = Cursor::new(&data[..PAGE_HEADER_SIZE]);
        let value_count  = header.read_u32::<LittleEndian>()? as usize;
        let first_row_id = header.read_u32::<LittleEndian>()?;
        let uncomp_size  = header.read_u32::<LittleEndian>()? as usize;
        let codec        = compression::codec_from_tag(header.read_u8()?)?;
        let has_nulls    = header.read_u8()? != 0;

        let raw = compression::decompress(&data[PAGE_HEADER_SIZE..payload_end], codec, uncomp_size)?;
        let corrupt = |e: std::io::Error| LakeError::Corruption(format!("truncated page body: {e}"));

        let (nulls, body) = if has_nulls {
            if raw.len() < value_count {
                return Err(LakeError::Corruption("page null map truncated".into()));
            }
            raw.split_at(value_count)
        } else {
            (&raw[..0], &raw[..])
        };

        let mut cur    = Cursor::new(body);
        let mut values = Vec::with_capacity(value_count);
        for i in 0..value_count {
            let v = decode_plain(&mut cur, field_type).map_err(corrupt)?;
            if has_nulls && nulls[i] != 0 {
                values.push(Value::Null);
            } else {
                values.push(v);
            }
        }

        Ok(Self { value_count, first_row_id, values })
    }
}
