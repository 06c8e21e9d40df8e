//! DeltaWriter：一个 (tablet, txn) 的导入写入
//!
//! `open → write* → finish → close`。`finish` 写出 segment 与 OpWrite 事务日志，
//! 对主键表还会预热主键索引。

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::chunk::Chunk;
use crate::common::{LakeError, PartitionId, Result, TabletId, TxnId};
use crate::field_type::encode_primary_key;
use crate::meta::{OpWrite, RowsetMetadata, RowsetTxnMeta, TabletSchema, TxnLog, TxnOp};
use crate::tablet::Tablet;
use crate::tablet_manager::TabletManager;
use crate::tablet_writer::TabletWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Opened,
    Finished,
    Closed,
}

pub struct DeltaWriter<'a> {
    tablet:       Tablet<'a>,
    txn_id:       TxnId,
    partition_id: PartitionId,
    schema:       Option<TabletSchema>,
    buffer:       Option<Chunk>,
    state:        State,
}

impl<'a> DeltaWriter<'a> {
    pub fn create(
        tablet_mgr:   &'a TabletManager,
        tablet_id:    TabletId,
        txn_id:       TxnId,
        partition_id: PartitionId,
    ) -> Self {
        Self {
            tablet: tablet_mgr.tablet(tablet_id),
            txn_id,
            partition_id,
            schema: None,
            buffer: None,
            state: State::Created,
        }
    }

    pub fn tablet_id(&self) -> TabletId { self.tablet.id() }

    pub fn txn_id(&self) -> TxnId { self.txn_id }

    /// 读取 tablet 最新 schema
    pub fn open(&mut self) -> Result<()> {
        if self.state != State::Created {
            return Err(LakeError::InvalidArgument(format!("delta writer of txn {} opened twice", self.txn_id)));
        }
        let version = self.tablet.latest_version()?;
        let schema = self.tablet.get_metadata(version)?.schema.clone();
        self.buffer = Some(Chunk::new(schema.num_columns()));
        self.schema = Some(schema);
        self.state = State::Opened;
        Ok(())
    }

    /// 追加 `chunk` 中 `row_indexes` 指定的行
    pub fn write(&mut self, chunk: &Chunk, row_indexes: &[u32]) -> Result<()> {
        match (self.state, self.buffer.as_mut()) {
            (State::Opened, Some(buf)) => buf.append_selective(chunk, row_indexes),
            _ => Err(LakeError::InvalidArgument(format!(
                "delta writer of txn {} is not writable ({:?})", self.txn_id, self.state
            ))),
        }
    }

    /// 主键表：按编码主键排序，相同主键只保留最后写入的一行
    fn dedup_by_primary_key(schema: &TabletSchema, chunk: Chunk) -> Result<Chunk> {
        let key_idx = schema.key_column_indexes();
        let mut keyed = Vec::with_capacity(chunk.num_rows());
        for (seq, row) in chunk.into_rows().into_iter().enumerate() {
            let key = encode_primary_key(&key_idx.iter().map(|&i| &row[i]).collect::<Vec<_>>())?;
            keyed.push((key, seq, row));
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        keyed.dedup_by(|later, earlier| later.0 == earlier.0);
        let mut out = Chunk::new(schema.num_columns());
        for (_, _, row) in keyed {
            out.append_row(row)?;
        }
        Ok(out)
    }

    pub fn finish(&mut self) -> Result<()> {
        let (schema, buffer) = match (self.state, self.schema.as_ref(), self.buffer.take()) {
            (State::Opened, Some(schema), Some(buffer)) => (schema.clone(), buffer),
            _ => {
                return Err(LakeError::InvalidArgument(format!(
                    "delta writer of txn {} cannot finish in state {:?}", self.txn_id, self.state
                )));
            }
        };
        let is_pk = schema.is_primary_key();
        let input_rows = buffer.num_rows();
        let data = if is_pk { Self::dedup_by_primary_key(&schema, buffer)? } else { buffer };

        let mut writer = TabletWriter::with_schema(self.tablet, self.txn_id, schema);
        writer.open()?;
        writer.write(&data)?;
        writer.finish()?;

        let write_time = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs() as i64);
        let rowset = RowsetMetadata {
            id:         0,
            segments:   writer.files().to_vec(),
            num_rows:   writer.num_rows(),
            data_size:  writer.data_size(),
            // 主键表整体排序后写入，segment 之间不重叠
            overlapped: !is_pk && writer.files().len() > 1,
        };
        writer.close();
        let log = TxnLog {
            tablet_id: self.tablet.id(),
            txn_id:    self.txn_id,
            op:        TxnOp::Write(OpWrite {
                rowset,
                rowset_txn_meta: Some(RowsetTxnMeta { partition_id: self.partition_id, write_time }),
            }),
        };
        self.tablet.put_txn_log(&log)?;
        self.state = State::Finished;
        debug!(
            target: "lake",
            tablet_id = self.tablet.id(),
            txn_id = self.txn_id,
            input_rows,
            rows = data.num_rows(),
            "delta writer finished"
        );

        if is_pk {
            if let Err(e) = self.tablet.update_mgr().preload_primary_key_index(&self.tablet) {
                warn!(target: "lake", tablet_id = self.tablet.id(), txn_id = self.txn_id, error = %e, "preload primary index failed");
            }
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.buffer = None;
        self.state = State::Closed;
    }
}
