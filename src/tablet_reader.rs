//! 按版本读取 tablet 的全部存活行

use std::sync::Arc;

use crate::chunk::Chunk;
use crate::common::{Result, RowId, Version};
use crate::field_type::{encode_primary_key, Value};
use crate::meta::TabletMetadata;
use crate::tablet::Tablet;

pub struct TabletReader<'a> {
    tablet:  Tablet<'a>,
    version: Version,
    meta:    Option<Arc<TabletMetadata>>,
}

impl<'a> TabletReader<'a> {
    pub fn new(tablet: Tablet<'a>, version: Version) -> Self {
        Self { tablet, version, meta: None }
    }

    /// 加载该版本的 metadata
    pub fn prepare(&mut self) -> Result<()> {
        if self.meta.is_none() {
            self.meta = Some(self.tablet.get_metadata(self.version)?);
        }
        Ok(())
    }

    /// 所有 segment 的行减去 delete vector。主键表按编码后的主键排序，
    /// 其余按 rowset / segment / 行号顺序。
    pub fn read_all(&mut self) -> Result<Chunk> {
        self.prepare()?;
        let meta = match &self.meta {
            Some(m) => m.clone(),
            None => return Ok(Chunk::default()),
        };
        let num_columns = meta.schema.num_columns();
        let mut rows: Vec<Vec<Value>> = Vec::new();
        for rowset in &meta.rowsets {
            for (i, segment) in rowset.segments.iter().enumerate() {
                let reader = self.tablet.read_segment(segment)?;
                let columns = (0..num_columns).map(|c| reader.read_column(c)).collect::<Result<Vec<_>>>()?;
                let delvec = self.tablet.get_del_vec(&meta, rowset.segment_rssid(i))?;
                let seg = Chunk::from_columns(columns)?;
                for (row_id, row) in seg.into_rows().into_iter().enumerate() {
                    if delvec.as_ref().is_some_and(|d| d.contains(row_id as RowId)) {
                        continue;
                    }
                    rows.push(row);
                }
            }
        }

        if meta.is_primary_key() {
            let key_idx = meta.schema.key_column_indexes();
            let mut keyed = rows.into_iter()
                .map(|row| {
                    let key = encode_primary_key(&key_idx.iter().map(|&i| &row[i]).collect::<Vec<_>>())?;
                    Ok((key, row))
                })
                .collect::<Result<Vec<_>>>()?;
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            rows = keyed.into_iter().map(|(_, row)| row).collect();
        }

        let mut out = Chunk::new(num_columns);
        for row in rows {
            out.append_row(row)?;
        }
        Ok(out)
    }

    pub fn count_rows(&mut self) -> Result<usize> {
        Ok(self.read_all()?.num_rows())
    }
}
