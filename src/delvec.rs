//! Delete vector：segment 内被逻辑删除的行号集合
//!
//! 页格式（小端）：
//! ```text
//! ┌──────────────────────────────┐
//! │ format   (u8) = 0x01         │
//! │ version  (i64)               │
//! │ len      (u32)               │
//! │ roaring bitmap (len bytes)   │
//! │ CRC32    (u32)               │  覆盖前面所有字节
//! └──────────────────────────────┘
//! ```

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use roaring::RoaringBitmap;

use crate::common::{LakeError, Result, RowId, Version};

const DELVEC_FORMAT_V1: u8 = 0x01;
const DELVEC_HEADER_SIZE: usize = 13;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DelVector {
    version: Version,
    rows:    RoaringBitmap,
}

impl DelVector {
    pub fn new(version: Version, rows: RoaringBitmap) -> Self {
        Self { version, rows }
    }

    pub fn from_rows(version: Version, rows: impl IntoIterator<Item = RowId>) -> Self {
        Self { version, rows: rows.into_iter().collect() }
    }

    pub fn version(&self) -> Version { self.version }

    pub fn set_version(&mut self, version: Version) { self.version = version; }

    pub fn cardinality(&self) -> u64 { self.rows.len() }

    pub fn is_empty(&self) -> bool { self.rows.is_empty() }

    pub fn contains(&self, row_id: RowId) -> bool { self.rows.contains(row_id) }

    pub fn rows(&self) -> &RoaringBitmap { &self.rows }

    /// 合并另一个删除集合（写路径使用并集，保证删除单调）
    pub fn union_with(&mut self, other: &RoaringBitmap) {
        self.rows |= other;
    }

    pub fn save_to(&self, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        out.push(DELVEC_FORMAT_V1);
        out.write_i64::<LittleEndian>(self.version)?;
        out.write_u32::<LittleEndian>(self.rows.serialized_size() as u32)?;
        self.rows.serialize_into(&mut *out)?;
        let crc = crc32fast::hash(&out[start..]);
        out.write_u32::<LittleEndian>(crc)?;
        Ok(())
    }

    pub fn load(data: &[u8]) -> Result<Self> {
        if data.len() < DELVEC_HEADER_SIZE + 4 {
            return Err(LakeError::Corruption(format!("delvec page too short: {} bytes", data.len())));
        }
        let body_end = data.len() - 4;
        let mut tail = Cursor::new(&data[body_end..]);
        let crc = tail.read_u32::<LittleEndian>()?;
        if crc != crc32fast::hash(&data[..body_end]) {
            return Err(LakeError::Corruption("delvec page checksum mismatch".into()));
        }
        if data[0] != DELVEC_FORMAT_V1 {
            return Err(LakeError::Corruption(format!("unknown delvec format {:#x}", data[0])));
        }
        let mut cur = Cursor::new(&data[1..DELVEC_HEADER_SIZE]);
        let version = cur.read_i64::<LittleEndian>()?;
        let len = cur.read_u32::<LittleEndian>()? as usize;
        if DELVEC_HEADER_SIZE + len != body_end {
            return Err(LakeError::Corruption(format!(
                "delvec length mismatch: header says {len}, page holds {}", body_end - DELVEC_HEADER_SIZE
            )));
        }
        let rows = RoaringBitmap::deserialize_from(&data[DELVEC_HEADER_SIZE..body_end])
            .map_err(|e| LakeError::Corruption(format!("decode delvec bitmap: {e}")))?;
        Ok(Self { version, rows })
    }
}
