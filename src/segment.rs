//! Segment 文件读写
//!
//! 文件格式：
//! ```text
//! ┌────────────────────────────────────┐
//! │  MAGIC  (8 bytes) "LAKESEG\0"      │
//! │  Version(4 bytes) = 1              │
//! ├────────────────────────────────────┤
//! │  DATA REGION                       │
//! │    [Data Pages col 0]              │ ← plain 编码 + LZ4
//! │    [Data Pages col 1]              │
//! │    ...                             │
//! ├────────────────────────────────────┤
//! │  FOOTER                            │
//! │    SegmentFooter                   │
//! │    Footer CRC32  (4 bytes)         │
//! │    Footer length (4 bytes)         │
//! │    MAGIC         (8 bytes)         │
//! └────────────────────────────────────┘
//! ```

use std::io::{Cursor, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::common::{LakeError, Result};
use crate::field_type::{CompressionType, FieldType, Value};
use crate::page::{PageBuilder, PageDecoder};

const MAGIC: &[u8; 8] = b"LAKESEG\0";
const VERSION: u32     = 1;
const HEADER_SIZE: u64 = 12;

// ── Footer 结构 ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePointer {
    pub offset: u64,
    pub size:   u64,
}

#[derive(Debug)]
pub struct ColumnFooter {
    pub field_type: FieldType,
    pub pages:      Vec<PagePointer>,
}

#[derive(Debug)]
pub struct SegmentFooter {
    pub num_rows: u32,
    pub columns:  Vec<ColumnFooter>,
}

impl SegmentFooter {
    fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(self.num_rows)?;
        out.write_u32::<LittleEndian>(self.columns.len() as u32)?;
        for col in &self.columns {
            out.push(col.field_type.to_tag());
            out.write_u32::<LittleEndian>(col.pages.len() as u32)?;
            for p in &col.pages {
                out.write_u64::<LittleEndian>(p.offset)?;
                out.write_u64::<LittleEndian>(p.size)?;
            }
        }
        Ok(out)
    }

    fn deserialize(data: &[u8]) -> std::io::Result<Self> {
        let mut cur     = Cursor::new(data);
        let num_rows    = cur.read_u32::<LittleEndian>()?;
        let num_columns = cur.read_u32::<LittleEndian>()?;
        let mut columns = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            let tag = cur.read_u8()?;
            let field_type = FieldType::from_tag(tag)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
            let page_count = cur.read_u32::<LittleEndian>()?;
            let mut pages  = Vec::with_capacity(page_count as usize);
            for _ in 0..page_count {
                let offset = cur.read_u64::<LittleEndian>()?;
                let size   = cur.read_u64::<LittleEndian>()?;
                pages.push(PagePointer { offset, size });
            }
            columns.push(ColumnFooter { field_type, pages });
        }
        Ok(Self { num_rows, columns })
    }
}

// ── SegmentWriter ─────────────────────────────────────────────────────────────

struct ColumnWriter {
    field_type: FieldType,
    current:    PageBuilder,
    pages:      Vec<Vec<u8>>,
}

pub struct SegmentWriter {
    columns:     Vec<ColumnWriter>,
    compression: CompressionType,
    num_rows:    u32,
}

impl SegmentWriter {
    pub fn new(field_types: Vec<FieldType>, compression: CompressionType) -> Self {
        let columns = field_types.into_iter()
            .map(|ft| ColumnWriter {
                field_type: ft,
                current:    PageBuilder::new(0, ft, compression),
                pages:      Vec::new(),
            })
            .collect();
        Self { columns, compression, num_rows: 0 }
    }

    /// 追加一行，`row` 的长度必须等于列数
    pub fn append_row(&mut self, row: &[Value]) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(LakeError::InvalidArgument(format!(
                "row has {} values, segment has {} columns", row.len(), self.columns.len()
            )));
        }
        if let Some((col, v)) = self.columns.iter().zip(row).find(|(c, v)| !v.matches(c.field_type)) {
            return Err(LakeError::InvalidArgument(format!(
                "value {v:?} does not match column type {:?}", col.field_type
            )));
        }
        for (col, v) in self.columns.iter_mut().zip(row) {
            if col.current.is_full() {
                let next = PageBuilder::new(self.num_rows, col.field_type, self.compression);
                let full = std::mem::replace(&mut col.current, next);
                col.pages.push(full.build()?);
            }
            col.current.add(v.clone())?;
        }
        self.num_rows += 1;
        Ok(())
    }

    /// 完成写入，将整个 Segment 序列化到字节流，返回写入的字节数
    pub fn finalize<W: Write>(self, mut writer: W) -> Result<u64> {
        writer.write_all(MAGIC)?;
        writer.write_u32::<LittleEndian>(VERSION)?;
        let mut pos = HEADER_SIZE;

        // ── DATA REGION ───────────────────────────────────────────────────────
        let mut footer_columns = Vec::with_capacity(self.columns.len());
        for mut col in self.columns {
            if !col.current.is_empty() {
                let last = std::mem::replace(
                    &mut col.current,
                    PageBuilder::new(0, col.field_type, self.compression),
                );
                col.pages.push(last.build()?);
            }
            let mut pointers = Vec::with_capacity(col.pages.len());
            for page in &col.pages {
                writer.write_all(page)?;
                pointers.push(PagePointer { offset: pos, size: page.len() as u64 });
                pos += page.len() as u64;
            }
            footer_columns.push(ColumnFooter { field_type: col.field_type, pages: pointers });
        }

        // ── FOOTER ────────────────────────────────────────────────────────────
        let footer = SegmentFooter { num_rows: self.num_rows, columns: footer_columns };
        let footer_bytes = footer.serialize()?;
        writer.write_all(&footer_bytes)?;
        writer.write_u32::<LittleEndian>(crc32fast::hash(&footer_bytes))?;
        writer.write_u32::<LittleEndian>(footer_bytes.len() as u32)?;
        writer.write_all(MAGIC)?;
        writer.flush()?;
        pos += footer_bytes.len() as u64 + 16;

        Ok(pos)
    }

    pub fn num_rows(&self) -> u32 { self.num_rows }
}

// ── SegmentReader ─────────────────────────────────────────────────────────────

pub struct SegmentReader {
    data:   Vec<u8>,
    footer: SegmentFooter,
}

impl SegmentReader {
    /// 从内存字节解析 Segment
    pub fn open(data: Vec<u8>) -> Result<Self> {
        let n = data.len();
        if n < HEADER_SIZE as usize + 16 || &data[..8] != MAGIC || &data[n - 8..] != MAGIC {
            return Err(LakeError::Corruption("invalid segment magic".into()));
        }
        let mut tail   = Cursor::new(&data[n - 16..n - 8]);
        let footer_crc = tail.read_u32::<LittleEndian>()?;
        let footer_len = tail.read_u32::<LittleEndian>()? as usize;
        let footer_start = (n - 16).checked_sub(footer_len)
            .filter(|s| *s >= HEADER_SIZE as usize)
            .ok_or_else(|| LakeError::Corruption(format!("invalid segment footer length {footer_len}")))?;
        let footer_bytes = &data[footer_start..n - 16];

        if crc32fast::hash(footer_bytes) != footer_crc {
            return Err(LakeError::Corruption("segment footer checksum mismatch".into()));
        }
        let footer = SegmentFooter::deserialize(footer_bytes)
            .map_err(|e| LakeError::Corruption(format!("cannot parse segment footer: {e}")))?;

        Ok(Self { data, footer })
    }

    pub fn num_rows(&self) -> u32 { self.footer.num_rows }

    pub fn num_columns(&self) -> usize { self.footer.columns.len() }

    /// 读取指定列的所有值
    pub fn read_column(&self, col_idx: usize) -> Result<Vec<Value>> {
        let col = self.footer.columns.get(col_idx)
            .ok_or_else(|| LakeError::InvalidArgument(format!("column {col_idx} not in segment")))?;

        let mut values = Vec::with_capacity(self.footer.num_rows as usize);
        for p in &col.pages {
            let start = p.offset as usize;
            let end = start.checked_add(p.size as usize)
                .filter(|e| *e <= self.data.len())
                .ok_or_else(|| LakeError::Corruption(format!("page out of range: {p:?}")))?;
            let decoded = PageDecoder::decode(&self.data[start..end], col.field_type)?;
            if decoded.first_row_id as usize != values.len() {
                return Err(LakeError::Corruption(format!(
                    "page ordinal mismatch: expected {}, got {}", values.len(), decoded.first_row_id
                )));
            }
            values.extend(decoded.values);
        }
        if values.len() != self.footer.num_rows as usize {
            return Err(LakeError::Corruption(format!(
                "column {col_idx} has {} rows, footer says {}", values.len(), self.footer.num_rows
            )));
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PAGE_MAX_ROWS;

    #[test]
    fn multi_page_segment_reads_back() {
        let n = PAGE_MAX_ROWS * 2 + 10;
        let mut w = SegmentWriter::new(vec![FieldType::Int32, FieldType::Bytes], CompressionType::Lz4);
        for i in 0..n {
            w.append_row(&[Value::Int32(i as i32), Value::Bytes(format!("v{i}").into_bytes())]).unwrap();
        }
        let mut buf = Vec::new();
        let written = w.finalize(&mut buf).unwrap();
        assert_eq!(written as usize, buf.len());

        let r = SegmentReader::open(buf).unwrap();
        assert_eq!(r.num_rows() as usize, n);
        assert_eq!(r.num_columns(), 2);
        let keys = r.read_column(0).unwrap();
        assert_eq!(keys.len(), n);
        assert_eq!(keys[n - 1], Value::Int32(n as i32 - 1));
        let vals = r.read_column(1).unwrap();
        assert_eq!(vals[PAGE_MAX_ROWS], Value::Bytes(format!("v{PAGE_MAX_ROWS}").into_bytes()));
    }

    #[test]
    fn empty_segment_is_valid() {
        let w = SegmentWriter::new(vec![FieldType::Int64], CompressionType::None);
        let mut buf = Vec::new();
        w.finalize(&mut buf).unwrap();
        let r = SegmentReader::open(buf).unwrap();
        assert_eq!(r.num_rows(), 0);
        assert!(r.read_column(0).unwrap().is_empty());
    }

    #[test]
    fn truncated_file_is_corruption() {
        let mut w = SegmentWriter::new(vec![FieldType::Int32], CompressionType::None);
        w.append_row(&[Value::Int32(1)]).unwrap();
        let mut buf = Vec::new();
        w.finalize(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(SegmentReader::open(buf).is_err());
    }
}
