use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use lake_storage_engine::chunk::Chunk;
use lake_storage_engine::common::{AggregateType, ColumnType, KeysType, LakeError, Rssid, TabletId, TxnId, Version};
use lake_storage_engine::config::LakeConfig;
use lake_storage_engine::delta_writer::DeltaWriter;
use lake_storage_engine::field_type::Value;
use lake_storage_engine::fs::{FileSystem, LocalFileSystem, WriteMode};
use lake_storage_engine::location::FixedLocationProvider;
use lake_storage_engine::meta::{
    ColumnSchema, OpCompaction, OpWrite, RowsetMetadata, TabletMetadata, TabletSchema, TxnLog, TxnOp,
};
use lake_storage_engine::meta_file::MetaFileBuilder;
use lake_storage_engine::{Result, TabletManager};
use tempfile::TempDir;

const CHUNK_SIZE: usize = 12;
const TABLET_ID: TabletId = 10086;
const PARTITION_ID: i64 = 4561;

// ── fixture ───────────────────────────────────────────────────────────────────

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

//  | column | type | KEY | NULL |
//  +--------+------+-----+------+
//  |   c0   |  INT | YES |  NO  |
//  |   c1   |  INT | NO  |  NO  |
fn pk_schema() -> TabletSchema {
    TabletSchema::new(7, KeysType::PrimaryKeys, vec![
        ColumnSchema::key(1, "c0", ColumnType::Int32),
        ColumnSchema::value(2, "c1", ColumnType::Int32, AggregateType::Replace),
    ])
}

fn test_config() -> LakeConfig {
    LakeConfig { publish_retry_backoff_ms: 1, publish_max_retries: 2, ..LakeConfig::default() }
}

struct Fixture {
    mgr:    Arc<TabletManager>,
    txn_id: TxnId,
    _dir:   TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self::build(Arc::new(LocalFileSystem::new()), test_config())
    }

    fn with_fs(fs: Arc<dyn FileSystem>) -> Self {
        Self::build(fs, test_config())
    }

    fn with_config(config: LakeConfig) -> Self {
        Self::build(Arc::new(LocalFileSystem::new()), config)
    }

    fn build(fs: Arc<dyn FileSystem>, config: LakeConfig) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let location = Arc::new(FixedLocationProvider::new(dir.path()));
        location.add_owned_tablet(TABLET_ID);
        let mgr = Arc::new(TabletManager::new(config, location, fs));
        mgr.create_tablet(&TabletMetadata::new(TABLET_ID, pk_schema())).unwrap();
        Self { mgr, txn_id: 1231, _dir: dir }
    }

    /// 通过 DeltaWriter 写入一批数据，返回事务 id
    fn write_batch(&mut self, chunk: &Chunk) -> TxnId {
        self.txn_id += 1;
        let indexes: Vec<u32> = (0..chunk.num_rows() as u32).collect();
        let mut writer = DeltaWriter::create(&self.mgr, TABLET_ID, self.txn_id, PARTITION_ID);
        writer.open().unwrap();
        writer.write(chunk, &indexes).unwrap();
        writer.finish().unwrap();
        writer.close();
        self.txn_id
    }

    /// 直接用 TabletWriter 写出 `chunk`，提交一个写事务日志
    fn write_segments(&mut self, chunk: &Chunk) -> TxnId {
        self.txn_id += 1;
        let tablet = self.mgr.tablet(TABLET_ID);
        let mut writer = tablet.new_writer(self.txn_id).unwrap();
        writer.open().unwrap();
        writer.write(chunk).unwrap();
        writer.finish().unwrap();
        let rowset = RowsetMetadata {
            segments:   writer.files().to_vec(),
            num_rows:   writer.num_rows(),
            data_size:  writer.data_size(),
            overlapped: writer.files().len() > 1,
            ..Default::default()
        };
        writer.close();
        tablet.put_txn_log(&TxnLog {
            tablet_id: TABLET_ID,
            txn_id:    self.txn_id,
            op:        TxnOp::Write(OpWrite { rowset, rowset_txn_meta: None }),
        }).unwrap();
        self.txn_id
    }

    /// 把 `rows` 写成一个新 rowset，提交合并 `inputs` 的 compaction 事务日志
    fn write_compaction(&mut self, inputs: &[u32], rows: &[(i32, i32)]) -> TxnId {
        self.txn_id += 1;
        let tablet = self.mgr.tablet(TABLET_ID);
        let mut writer = tablet.new_writer(self.txn_id).unwrap();
        writer.open().unwrap();
        let output = Chunk::from_columns(vec![
            rows.iter().map(|(k, _)| Value::Int32(*k)).collect(),
            rows.iter().map(|(_, v)| Value::Int32(*v)).collect(),
        ]).unwrap();
        writer.write(&output).unwrap();
        writer.finish().unwrap();
        let output_rowset = RowsetMetadata {
            segments:  writer.files().to_vec(),
            num_rows:  writer.num_rows(),
            data_size: writer.data_size(),
            ..Default::default()
        };
        tablet.put_txn_log(&TxnLog {
            tablet_id: TABLET_ID,
            txn_id:    self.txn_id,
            op:        TxnOp::Compaction(OpCompaction {
                input_rowsets: inputs.to_vec(),
                output_rowset: Some(output_rowset),
                output_delvec: Vec::new(),
            }),
        }).unwrap();
        self.txn_id
    }

    fn publish(&self, base: Version, txn_id: TxnId) -> Result<f64> {
        self.mgr.publish_version(TABLET_ID, base, base + 1, &[txn_id])
    }

    fn read_rows(&self, version: Version) -> Vec<(i32, i32)> {
        let chunk = self.mgr.tablet(TABLET_ID).new_reader(version).read_all().unwrap();
        chunk.into_rows().into_iter()
            .map(|r| (r[0].as_i32().unwrap(), r[1].as_i32().unwrap()))
            .collect()
    }

    fn read(&self, version: Version) -> usize {
        let rows = self.read_rows(version);
        let keys: BTreeSet<i32> = rows.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys.len(), rows.len(), "duplicate primary keys at version {version}");
        rows.len()
    }

    fn metadata(&self, version: Version) -> Arc<TabletMetadata> {
        self.mgr.get_tablet_metadata(TABLET_ID, version).unwrap()
    }

    fn deleted_rows(&self, version: Version) -> BTreeMap<Rssid, BTreeSet<u32>> {
        let meta = self.metadata(version);
        let tablet = self.mgr.tablet(TABLET_ID);
        meta.delvec_meta.delvecs.keys()
            .map(|rssid| {
                let dv = tablet.get_del_vec(&meta, *rssid).unwrap().unwrap();
                (*rssid, dv.rows().iter().collect())
            })
            .collect()
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            let refs = self.mgr.update_mgr().primary_index_ref_count(TABLET_ID);
            assert!(matches!(refs, None | Some(1)), "primary index ref count {refs:?}");
        }
    }
}

fn shuffle(v: &mut [i32], mut seed: u64) {
    for i in (1..v.len()).rev() {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        v.swap(i, (seed % (i as u64 + 1)) as usize);
    }
}

/// key = i + shift * chunk_size（乱序），value = key * 3
fn generate_data(chunk_size: usize, shift: usize) -> Chunk {
    let mut keys: Vec<i32> = (0..chunk_size).map(|i| (i + shift * chunk_size) as i32).collect();
    shuffle(&mut keys, 0x9E37_79B9_7F4A_7C15);
    let values = keys.iter().map(|k| Value::Int32(k * 3)).collect();
    Chunk::from_columns(vec![keys.into_iter().map(Value::Int32).collect(), values]).unwrap()
}

// ── scenarios ─────────────────────────────────────────────────────────────────

#[test]
fn write_read_success() {
    let mut f = Fixture::new();
    let k0: Vec<i32> = (1..=22).collect();
    let mut v0: Vec<i32> = k0.iter().map(|k| k * 2).collect();
    v0[20] = 41;
    v0[21] = 44;
    let chunk = Chunk::from_columns(vec![
        k0.iter().copied().map(Value::Int32).collect(),
        v0.iter().copied().map(Value::Int32).collect(),
    ]).unwrap();

    f.txn_id += 1;
    let txn_id = f.txn_id;
    let tablet = f.mgr.get_tablet(TABLET_ID).unwrap();
    let mut writer = tablet.new_writer(txn_id).unwrap();
    writer.open().unwrap();
    writer.write(&chunk).unwrap();
    writer.finish().unwrap();
    let rowset = RowsetMetadata {
        segments:   writer.files().to_vec(),
        num_rows:   writer.num_rows(),
        data_size:  writer.data_size(),
        overlapped: false,
        ..Default::default()
    };
    writer.close();
    f.mgr.put_txn_log(&TxnLog {
        tablet_id: TABLET_ID,
        txn_id,
        op: TxnOp::Write(OpWrite { rowset, rowset_txn_meta: None }),
    }).unwrap();

    let score = f.mgr.publish_version(TABLET_ID, 1, 2, &[txn_id]).unwrap();
    assert!(score > 0.0);

    let expected: Vec<(i32, i32)> = k0.into_iter().zip(v0).collect();
    assert_eq!(f.read_rows(2), expected);
}

#[test]
fn write_multitime_check_result() {
    let mut f = Fixture::new();
    let chunk0 = generate_data(CHUNK_SIZE, 0);
    let mut version = 1;
    for _ in 0..3 {
        let txn_id = f.write_batch(&chunk0);
        f.publish(version, txn_id).unwrap();
        version += 1;
    }
    assert_eq!(f.read(version), CHUNK_SIZE);
    assert_eq!(f.metadata(version).rowsets.len(), 3);
    let expected: Vec<(i32, i32)> = (0..CHUNK_SIZE as i32).map(|k| (k, k * 3)).collect();
    assert_eq!(f.read_rows(version), expected);
    assert_eq!(f.mgr.update_mgr().primary_index_ref_count(TABLET_ID), Some(1));
}

#[test]
fn write_fail_retry() {
    let mut f = Fixture::new();
    let chunks: Vec<Chunk> = (0..5).map(|i| generate_data(CHUNK_SIZE, i)).collect();
    let mut version = 1;
    for chunk in &chunks[..3] {
        let txn_id = f.write_batch(chunk);
        f.publish(version, txn_id).unwrap();
        version += 1;
    }

    // 更新主键索引后不 finalize，模拟 finalize 失败
    for chunk in &chunks[3..] {
        let txn_id = f.write_batch(chunk);
        let tablet = f.mgr.get_tablet(TABLET_ID).unwrap();
        let log = tablet.get_txn_log(txn_id).unwrap();
        let TxnOp::Write(op_write) = &log.op else { panic!("expected a write txn log") };
        let base = tablet.get_metadata(version).unwrap();
        let mut next = base.as_ref().clone();
        next.version = version + 1;
        let mut builder = MetaFileBuilder::new(tablet, next);
        tablet.update_mgr()
            .publish_primary_key_tablet(op_write, txn_id, &tablet, &mut builder, version)
            .unwrap();
        assert!(builder.has_update_index());
        builder.handle_failure();
        assert!(!f.mgr.update_mgr().index_cache().contains(TABLET_ID));
    }

    for chunk in &chunks[3..] {
        let txn_id = f.write_batch(chunk);
        f.publish(version, txn_id).unwrap();
        version += 1;
    }
    assert_eq!(f.read(version), CHUNK_SIZE * 5);
    assert_eq!(f.metadata(version).rowsets.len(), 5);
}

#[test]
fn publish_multi_times() {
    let mut f = Fixture::new();
    let chunk0 = generate_data(CHUNK_SIZE, 0);
    let mut version = 1;
    let mut txn_id = 0;
    for _ in 0..3 {
        txn_id = f.write_batch(&chunk0);
        f.publish(version, txn_id).unwrap();
        version += 1;
    }
    assert_eq!(f.read(version), CHUNK_SIZE);
    let before = f.metadata(version);
    assert_eq!(before.rowsets.len(), 3);

    // 重复发布
    f.mgr.publish_version(TABLET_ID, version - 1, version, &[txn_id]).unwrap();
    // 用旧版本发布
    f.mgr.publish_version(TABLET_ID, version - 2, version - 1, &[txn_id]).unwrap();
    // version + 1 不存在，跳跃发布必须失败
    let err = f.mgr.publish_version(TABLET_ID, version + 1, version + 2, &[txn_id]).unwrap_err();
    assert!(err.is_not_found());

    assert_eq!(f.read(version), CHUNK_SIZE);
    assert_eq!(f.metadata(version), before);
    assert_eq!(f.mgr.latest_version(TABLET_ID).unwrap(), version);
}

#[test]
fn publish_concurrent() {
    let mut f = Fixture::new();
    let chunk0 = generate_data(CHUNK_SIZE, 0);
    let mut version = 1;
    for _ in 0..3 {
        let txn_id = f.write_batch(&chunk0);
        let results: Vec<Result<f64>> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..5)
                .map(|_| s.spawn(|| f.mgr.publish_version(TABLET_ID, version, version + 1, &[txn_id])))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        let scores: Vec<f64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert!(scores.windows(2).all(|w| w[0] == w[1]));
        version += 1;
    }
    assert_eq!(f.mgr.latest_version(TABLET_ID).unwrap(), 4);
    assert_eq!(f.read(version), CHUNK_SIZE);
    assert_eq!(f.metadata(version).rowsets.len(), 3);
}

#[test]
fn resolve_conflict() {
    let mut f = Fixture::new();
    let chunk0 = generate_data(CHUNK_SIZE, 0);
    let mut version = 1;
    for _ in 0..3 {
        let txn_id = f.write_batch(&chunk0);
        f.publish(version, txn_id).unwrap();
        version += 1;
    }
    assert_eq!(f.read(version), CHUNK_SIZE);
    assert_eq!(f.metadata(version).rowsets.len(), 3);

    // 三个事务都基于版本 4 写入，finish 时会预热索引
    let txns: Vec<TxnId> = (0..3).map(|_| f.write_batch(&chunk0)).collect();
    assert!(txns.windows(2).all(|w| w[0] < w[1]));
    for txn_id in txns {
        f.publish(version, txn_id).unwrap();
        version += 1;
    }
    assert_eq!(version, 7);
    assert_eq!(f.read(version), CHUNK_SIZE);
    assert_eq!(f.metadata(version).rowsets.len(), 6);
}

// ── properties ────────────────────────────────────────────────────────────────

#[test]
fn versions_are_dense_and_rowset_ids_grow() {
    let mut f = Fixture::new();
    let mut version = 1;
    for shift in [0, 0, 1] {
        let txn_id = f.write_batch(&generate_data(CHUNK_SIZE, shift));
        f.publish(version, txn_id).unwrap();
        version += 1;
    }
    assert_eq!(f.mgr.list_tablet_metadata_versions(TABLET_ID).unwrap(), vec![1, 2, 3, 4]);
    for v in 1..=version {
        assert_eq!(f.metadata(v).version, v);
    }
    assert!(f.mgr.get_tablet_metadata(TABLET_ID, version + 1).unwrap_err().is_not_found());

    let ids: Vec<u32> = (1..=version).map(|v| f.metadata(v).next_rowset_id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert_eq!(f.read(version), CHUNK_SIZE * 2);
}

#[test]
fn delete_vectors_only_grow() {
    let mut f = Fixture::new();
    let chunk0 = generate_data(CHUNK_SIZE, 0);
    let mut version = 1;
    let mut previous: BTreeMap<Rssid, BTreeSet<u32>> = BTreeMap::new();
    for _ in 0..4 {
        let txn_id = f.write_batch(&chunk0);
        f.publish(version, txn_id).unwrap();
        version += 1;
        let current = f.deleted_rows(version);
        for (rssid, rows) in &previous {
            assert!(rows.is_subset(&current[rssid]), "delete vector of rssid {rssid} shrank");
        }
        previous = current;
    }
    // 前三个 rowset 的每一行都被覆盖
    assert_eq!(previous.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(previous.values().all(|rows| rows.len() == CHUNK_SIZE));
    let meta = f.metadata(version);
    assert!(meta.delvec_meta.delvecs.values().all(|p| p.version <= version));
}

#[test]
fn duplicate_keys_within_one_write_keep_the_last() {
    let mut f = Fixture::new();
    let chunk = Chunk::from_columns(vec![
        vec![Value::Int32(1), Value::Int32(2), Value::Int32(1)],
        vec![Value::Int32(10), Value::Int32(20), Value::Int32(11)],
    ]).unwrap();
    let txn_id = f.write_batch(&chunk);
    f.publish(1, txn_id).unwrap();
    assert_eq!(f.read_rows(2), vec![(1, 11), (2, 20)]);
    assert_eq!(f.metadata(2).rowsets[0].num_rows, 2);
}

#[test]
fn duplicate_keys_across_segments_of_one_write() {
    let mut f = Fixture::with_config(LakeConfig { max_rows_per_segment: 2, ..test_config() });
    let chunk = Chunk::from_columns(vec![
        vec![Value::Int32(1), Value::Int32(2), Value::Int32(1), Value::Int32(3)],
        vec![Value::Int32(10), Value::Int32(20), Value::Int32(11), Value::Int32(30)],
    ]).unwrap();
    let txn_id = f.write_segments(&chunk);
    f.publish(1, txn_id).unwrap();

    let meta = f.metadata(2);
    assert_eq!(meta.rowsets[0].num_segments(), 2);
    assert_eq!(meta.next_rowset_id, 3);
    assert_eq!(f.read_rows(2), vec![(1, 11), (2, 20), (3, 30)]);
    // 删除落在新 rowset 自己的第一个 segment
    assert_eq!(f.deleted_rows(2), BTreeMap::from([(1, BTreeSet::from([0]))]));
}

#[test]
fn publish_twice_yields_identical_metadata() {
    let mut f = Fixture::new();
    let txn_id = f.write_batch(&generate_data(CHUNK_SIZE, 0));
    let first = f.publish(1, txn_id).unwrap();
    let meta = f.metadata(2);
    let second = f.publish(1, txn_id).unwrap();
    assert_eq!(first, second);
    assert_eq!(f.metadata(2), meta);
    assert!(f.mgr.get_txn_log(TABLET_ID, txn_id).unwrap_err().is_not_found());
}

#[test]
fn multiple_txns_in_one_publish() {
    let mut f = Fixture::new();
    let a = f.write_batch(&generate_data(CHUNK_SIZE, 0));
    let b = f.write_batch(&generate_data(CHUNK_SIZE, 0));
    let c = f.write_batch(&generate_data(CHUNK_SIZE, 1));
    f.mgr.publish_version(TABLET_ID, 1, 2, &[a, b, c]).unwrap();
    let meta = f.metadata(2);
    assert_eq!(meta.rowsets.len(), 3);
    assert_eq!(meta.txn_ids, vec![a, b, c]);
    assert_eq!(f.read(2), CHUNK_SIZE * 2);
    assert_eq!(f.deleted_rows(2)[&1].len(), CHUNK_SIZE);
}

// ── compaction ────────────────────────────────────────────────────────────────

#[test]
fn primary_key_compaction_reloads_index() {
    let mut f = Fixture::new();
    let chunk0 = generate_data(CHUNK_SIZE, 0);
    let mut version = 1;
    for _ in 0..3 {
        let txn_id = f.write_batch(&chunk0);
        f.publish(version, txn_id).unwrap();
        version += 1;
    }
    let live = f.read_rows(version);

    let txn_id = f.write_compaction(&[1, 2, 3], &live);
    f.publish(version, txn_id).unwrap();
    version += 1;
    let meta = f.metadata(version);
    assert_eq!(meta.rowsets.iter().map(|r| r.id).collect::<Vec<_>>(), vec![4]);
    assert!(meta.delvec_meta.delvecs.is_empty());
    assert!(!f.mgr.update_mgr().index_cache().contains(TABLET_ID));
    assert_eq!(f.read_rows(version), live);

    let txn_id = f.write_batch(&chunk0);
    f.publish(version, txn_id).unwrap();
    version += 1;
    assert_eq!(f.read(version), CHUNK_SIZE);
    assert_eq!(f.deleted_rows(version)[&4].len(), CHUNK_SIZE);
}

#[test]
fn compaction_and_write_in_one_publish() {
    let mut f = Fixture::new();
    let chunk0 = generate_data(CHUNK_SIZE, 0);
    let mut version = 1;
    for _ in 0..3 {
        let txn_id = f.write_batch(&chunk0);
        f.publish(version, txn_id).unwrap();
        version += 1;
    }
    let live = f.read_rows(version);
    let compaction = f.write_compaction(&[1, 2, 3], &live);
    let write = f.write_batch(&chunk0);

    f.mgr.publish_version(TABLET_ID, version, version + 1, &[compaction, write]).unwrap();
    version += 1;
    let meta = f.metadata(version);
    assert_eq!(meta.rowsets.iter().map(|r| r.id).collect::<Vec<_>>(), vec![4, 5]);
    assert_eq!(f.deleted_rows(version).keys().copied().collect::<Vec<_>>(), vec![4]);
    assert_eq!(f.deleted_rows(version)[&4].len(), CHUNK_SIZE);
    assert_eq!(f.read(version), CHUNK_SIZE);

    // 索引随发布推进到新版本，后续写入直接复用
    let txn_id = f.write_batch(&chunk0);
    f.publish(version, txn_id).unwrap();
    version += 1;
    assert_eq!(f.deleted_rows(version)[&5].len(), CHUNK_SIZE);
    assert_eq!(f.read(version), CHUNK_SIZE);
}

#[test]
fn compaction_with_unknown_input_is_rejected() {
    let mut f = Fixture::new();
    let txn_id = f.write_batch(&generate_data(CHUNK_SIZE, 0));
    f.publish(1, txn_id).unwrap();

    f.txn_id += 1;
    let bad = f.txn_id;
    f.mgr.put_txn_log(&TxnLog {
        tablet_id: TABLET_ID,
        txn_id: bad,
        op: TxnOp::Compaction(OpCompaction { input_rowsets: vec![99], ..Default::default() }),
    }).unwrap();
    let err = f.publish(2, bad).unwrap_err();
    assert!(matches!(err, LakeError::InvalidArgument(_)));
    assert!(f.mgr.get_tablet_metadata(TABLET_ID, 3).unwrap_err().is_not_found());
    assert!(f.mgr.get_txn_log(TABLET_ID, bad).is_ok());
}

// ── fault injection ───────────────────────────────────────────────────────────

/// 对 `.meta` 文件的写入按计数注入 I/O 错误
#[derive(Default)]
struct FaultyFileSystem {
    inner:                   LocalFileSystem,
    failing_metadata_writes: AtomicU32,
}

impl FaultyFileSystem {
    fn fail_next_metadata_writes(&self, n: u32) {
        self.failing_metadata_writes.store(n, Ordering::SeqCst);
    }
}

impl FileSystem for FaultyFileSystem {
    fn read_all(&self, path: &Path) -> Result<Vec<u8>> { self.inner.read_all(path) }

    fn read_at(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.inner.read_at(path, offset, len)
    }

    fn write_atomic(&self, path: &Path, data: &[u8], mode: WriteMode) -> Result<()> {
        if path.extension().is_some_and(|e| e == "meta") {
            let injected = self.failing_metadata_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(LakeError::IoError(format!("injected failure writing {}", path.display())));
            }
        }
        self.inner.write_atomic(path, data, mode)
    }

    fn exists(&self, path: &Path) -> Result<bool> { self.inner.exists(path) }

    fn delete(&self, path: &Path) -> Result<()> { self.inner.delete(path) }

    fn list(&self, dir: &Path) -> Result<Vec<String>> { self.inner.list(dir) }

    fn create_dirs(&self, dir: &Path) -> Result<()> { self.inner.create_dirs(dir) }
}

#[test]
fn transient_io_errors_are_retried() {
    let fs = Arc::new(FaultyFileSystem::default());
    let mut f = Fixture::with_fs(fs.clone());
    let txn_id = f.write_batch(&generate_data(CHUNK_SIZE, 0));
    fs.fail_next_metadata_writes(2);
    f.publish(1, txn_id).unwrap();
    assert_eq!(f.read(2), CHUNK_SIZE);
}

#[test]
fn failed_publish_invalidates_index_and_retry_converges() {
    let chunk0 = generate_data(CHUNK_SIZE, 0);

    let mut reference = Fixture::new();
    for version in 1..=2 {
        let txn_id = reference.write_batch(&chunk0);
        reference.publish(version, txn_id).unwrap();
    }

    let fs = Arc::new(FaultyFileSystem::default());
    let mut f = Fixture::with_fs(fs.clone());
    let txn_id = f.write_batch(&chunk0);
    f.publish(1, txn_id).unwrap();

    let txn_id = f.write_batch(&chunk0);
    fs.fail_next_metadata_writes(10);
    let err = f.publish(2, txn_id).unwrap_err();
    assert!(err.is_retryable());
    assert!(!f.mgr.update_mgr().index_cache().contains(TABLET_ID));
    assert!(f.mgr.get_tablet_metadata(TABLET_ID, 3).unwrap_err().is_not_found());
    assert!(f.mgr.get_txn_log(TABLET_ID, txn_id).is_ok());

    fs.fail_next_metadata_writes(0);
    f.publish(2, txn_id).unwrap();

    let (got, want) = (f.metadata(3), reference.metadata(3));
    assert_eq!(got.rowsets, want.rowsets);
    assert_eq!(got.next_rowset_id, want.next_rowset_id);
    // delvec 文件名各自带 nonce，只比较页位置
    let pages = |m: &TabletMetadata| -> Vec<_> {
        m.delvec_meta.delvecs.iter().map(|(rssid, p)| (*rssid, p.offset, p.size, p.version)).collect()
    };
    assert_eq!(pages(&got), pages(&want));
    assert_eq!(f.deleted_rows(3), reference.deleted_rows(3));
    assert_eq!(f.read_rows(3), reference.read_rows(3));
}

/// 第一次写 `.meta` 之前预热主键索引，模拟发布窗口内 delta writer 的 preload
#[derive(Default)]
struct PreloadOnMetadataWrite {
    inner: LocalFileSystem,
    mgr:   OnceLock<Weak<TabletManager>>,
    armed: AtomicBool,
}

impl PreloadOnMetadataWrite {
    fn attach(&self, mgr: &Arc<TabletManager>) {
        let _ = self.mgr.set(Arc::downgrade(mgr));
    }

    fn arm(&self) { self.armed.store(true, Ordering::SeqCst); }

    fn is_armed(&self) -> bool { self.armed.load(Ordering::SeqCst) }
}

impl FileSystem for PreloadOnMetadataWrite {
    fn read_all(&self, path: &Path) -> Result<Vec<u8>> { self.inner.read_all(path) }

    fn read_at(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.inner.read_at(path, offset, len)
    }

    fn write_atomic(&self, path: &Path, data: &[u8], mode: WriteMode) -> Result<()> {
        let is_meta = path.extension().is_some_and(|e| e == "meta");
        if is_meta && self.armed.swap(false, Ordering::SeqCst) {
            if let Some(mgr) = self.mgr.get().and_then(Weak::upgrade) {
                mgr.update_mgr().preload_primary_key_index(&mgr.tablet(TABLET_ID))?;
            }
        }
        self.inner.write_atomic(path, data, mode)
    }

    fn exists(&self, path: &Path) -> Result<bool> { self.inner.exists(path) }

    fn delete(&self, path: &Path) -> Result<()> { self.inner.delete(path) }

    fn list(&self, dir: &Path) -> Result<Vec<String>> { self.inner.list(dir) }

    fn create_dirs(&self, dir: &Path) -> Result<()> { self.inner.create_dirs(dir) }
}

#[test]
fn preload_during_compaction_publish_is_discarded() {
    let fs = Arc::new(PreloadOnMetadataWrite::default());
    let mut f = Fixture::with_fs(fs.clone());
    fs.attach(&f.mgr);
    let chunk0 = generate_data(CHUNK_SIZE, 0);
    let mut version = 1;
    for _ in 0..3 {
        let txn_id = f.write_batch(&chunk0);
        f.publish(version, txn_id).unwrap();
        version += 1;
    }
    let live = f.read_rows(version);
    let compaction = f.write_compaction(&[1, 2, 3], &live);

    fs.arm();
    f.publish(version, compaction).unwrap();
    version += 1;
    assert!(!fs.is_armed());
    // 窗口内加载的是 compaction 之前的版本，不能留在缓存里
    assert!(!f.mgr.update_mgr().index_cache().contains(TABLET_ID));

    let txn_id = f.write_batch(&chunk0);
    f.publish(version, txn_id).unwrap();
    version += 1;
    assert_eq!(f.read(version), CHUNK_SIZE);
    assert_eq!(f.deleted_rows(version)[&4].len(), CHUNK_SIZE);
}
