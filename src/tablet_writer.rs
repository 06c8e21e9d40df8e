//! 把 `Chunk` 写成 segment 文件

use tracing::debug;

use crate::chunk::Chunk;
use crate::common::{LakeError, Result, TxnId};
use crate::field_type::{CompressionType, FieldType};
use crate::fs::WriteMode;
use crate::meta::TabletSchema;
use crate::segment::SegmentWriter;
use crate::tablet::Tablet;

pub struct TabletWriter<'a> {
    tablet:       Tablet<'a>,
    txn_id:       TxnId,
    schema:       TabletSchema,
    field_types:  Vec<FieldType>,
    compression:  CompressionType,
    max_rows:     usize,
    current:      Option<SegmentWriter>,
    files:        Vec<String>,
    num_rows:     u64,
    data_size:    u64,
    opened:       bool,
    finished:     bool,
}

impl<'a> TabletWriter<'a> {
    /// 使用 tablet 最新版本的 schema
    pub fn new(tablet: Tablet<'a>, txn_id: TxnId) -> Result<Self> {
        let version = tablet.latest_version()?;
        let schema = tablet.get_metadata(version)?.schema.clone();
        Ok(Self::with_schema(tablet, txn_id, schema))
    }

    pub fn with_schema(tablet: Tablet<'a>, txn_id: TxnId, schema: TabletSchema) -> Self {
        let config = tablet.tablet_mgr().config();
        Self {
            tablet,
            txn_id,
            field_types: schema.field_types(),
            schema,
            compression: config.segment_compression,
            max_rows: config.max_rows_per_segment.max(1),
            current: None,
            files: Vec::new(),
            num_rows: 0,
            data_size: 0,
            opened: false,
            finished: false,
        }
    }

    pub fn schema(&self) -> &TabletSchema { &self.schema }

    pub fn open(&mut self) -> Result<()> {
        self.opened = true;
        Ok(())
    }

    pub fn write(&mut self, chunk: &Chunk) -> Result<()> {
        if !self.opened || self.finished {
            return Err(LakeError::InvalidArgument(format!(
                "tablet writer of txn {} is not writable", self.txn_id
            )));
        }
        if chunk.num_columns() != self.field_types.len() {
            return Err(LakeError::InvalidArgument(format!(
                "chunk has {} columns, schema has {}", chunk.num_columns(), self.field_types.len()
            )));
        }
        for i in 0..chunk.num_rows() {
            let full = self.current.as_ref().is_some_and(|w| w.num_rows() as usize >= self.max_rows);
            if full {
                self.flush_segment()?;
            }
            let writer = self.current
                .get_or_insert_with(|| SegmentWriter::new(self.field_types.clone(), self.compression));
            writer.append_row(&chunk.row(i))?;
        }
        Ok(())
    }

    fn flush_segment(&mut self) -> Result<()> {
        let Some(writer) = self.current.take() else { return Ok(()) };
        let rows = writer.num_rows() as u64;
        let name = format!("{:016x}_{:016x}_{}.dat", self.tablet.id(), self.txn_id, self.files.len());
        let mut buf = Vec::new();
        let size = writer.finalize(&mut buf)?;
        let path = self.tablet.segment_location(&name);
        self.tablet.tablet_mgr().file_system().write_atomic(&path, &buf, WriteMode::Overwrite)?;
        debug!(target: "lake", tablet_id = self.tablet.id(), txn_id = self.txn_id, segment = %name, rows, bytes = size, "segment written");
        self.files.push(name);
        self.num_rows += rows;
        self.data_size += size;
        Ok(())
    }

    /// 写出最后一个 segment
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.flush_segment()?;
        self.finished = true;
        Ok(())
    }

    pub fn files(&self) -> &[String] { &self.files }

    pub fn num_rows(&self) -> u64 { self.num_rows }

    pub fn data_size(&self) -> u64 { self.data_size }

    /// 丢弃未 finish 的数据
    pub fn close(&mut self) {
        self.current = None;
        self.finished = true;
    }
}
