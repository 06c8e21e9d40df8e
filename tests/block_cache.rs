use std::sync::Arc;

use lake_storage_engine::block_cache::BlockCache;
use lake_storage_engine::common::{KeysType, ColumnType};
use lake_storage_engine::config::{BlockCacheOptions, DiskSpace, LakeConfig};
use lake_storage_engine::fs::LocalFileSystem;
use lake_storage_engine::location::{FixedLocationProvider, LocationProvider};
use lake_storage_engine::meta::{ColumnSchema, TabletMetadata, TabletSchema};
use lake_storage_engine::meta_file::MetaFileReader;
use lake_storage_engine::TabletManager;

const BLOCK_SIZE: usize = 64 * 1024;

fn hybrid_options(dir: &std::path::Path, mem_blocks: usize) -> BlockCacheOptions {
    BlockCacheOptions {
        mem_space_size: mem_blocks * BLOCK_SIZE,
        disk_spaces:    vec![DiskSpace { path: dir.join("disk"), size: 500 * BLOCK_SIZE }],
        block_size:     BLOCK_SIZE,
        engine:         "hybrid".into(),
    }
}

#[test]
fn hybrid_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache = BlockCache::new();
    cache.init(&hybrid_options(dir.path(), 20)).unwrap();

    let cache_key = "test_file";
    let batch_size = BLOCK_SIZE - 1234;
    let rounds = 30;
    for i in 0..rounds {
        let ch = b'a' + (i % 26) as u8;
        cache.write_cache(cache_key, (i * batch_size) as u64, &vec![ch; batch_size], true).unwrap();
    }
    let stats = cache.stats();
    assert!(stats.disk_entries > 0, "{stats:?}");
    assert_eq!(stats.mem_entries + stats.disk_entries, rounds);

    for i in 0..rounds {
        let ch = b'a' + (i % 26) as u8;
        let got = cache.read_cache(cache_key, (i * batch_size) as u64, batch_size).unwrap();
        assert_eq!(got, vec![ch; batch_size]);
    }

    // 部分读
    let got = cache.read_cache(cache_key, 0, 100).unwrap();
    assert_eq!(got, vec![b'a'; 100]);

    cache.remove_cache(cache_key, 0, batch_size).unwrap();
    assert!(cache.read_cache(cache_key, 0, batch_size).unwrap_err().is_not_found());

    cache.shutdown().unwrap();
    assert!(!cache.is_initialized());
}

#[test]
fn write_with_overwrite_option() {
    let dir = tempfile::tempdir().unwrap();
    let cache = BlockCache::new();
    cache.init(&hybrid_options(dir.path(), 20)).unwrap();

    let value = vec![b'a'; 1024];
    cache.write_cache("test_file", 0, &value, true).unwrap();
    let err = cache.write_cache("test_file", 0, &vec![b'b'; 1024], false).unwrap_err();
    assert!(err.is_already_exists());
    assert_eq!(cache.read_cache("test_file", 0, 1024).unwrap(), value);

    let value = vec![b'c'; 1024];
    cache.write_cache("test_file", 0, &value, true).unwrap();
    assert_eq!(cache.read_cache("test_file", 0, 1024).unwrap(), value);

    cache.shutdown().unwrap();
}

#[test]
fn auto_create_disk_cache_path() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("a").join("b").join("cache");
    let cache = BlockCache::new();
    cache.init(&BlockCacheOptions {
        mem_space_size: BLOCK_SIZE,
        disk_spaces:    vec![DiskSpace { path: nested.clone(), size: 10 * BLOCK_SIZE }],
        block_size:     BLOCK_SIZE,
        engine:         "hybrid".into(),
    }).unwrap();
    assert!(nested.is_dir());

    cache.write_cache("f", 0, &vec![1u8; 16], true).unwrap();
    assert_eq!(cache.read_cache("f", 0, 16).unwrap(), vec![1u8; 16]);
    cache.shutdown().unwrap();
}

#[test]
fn memory_engine_drops_evicted_blocks() {
    let cache = BlockCache::new();
    cache.init(&BlockCacheOptions {
        mem_space_size: 2 * BLOCK_SIZE,
        block_size:     BLOCK_SIZE,
        engine:         "memory".into(),
        ..Default::default()
    }).unwrap();
    for i in 0..3u64 {
        cache.write_cache("f", i, &vec![0u8; BLOCK_SIZE], true).unwrap();
    }
    assert!(cache.read_cache("f", 0, BLOCK_SIZE).unwrap_err().is_not_found());
    assert!(cache.read_cache("f", 2, BLOCK_SIZE).is_ok());
    assert_eq!(cache.stats().disk_entries, 0);
}

#[test]
fn meta_file_reader_fills_block_cache() {
    let dir = tempfile::tempdir().unwrap();
    let location = Arc::new(FixedLocationProvider::new(dir.path()));
    location.add_owned_tablet(42);
    let cache = Arc::new(BlockCache::new());
    cache.init(&hybrid_options(dir.path(), 4)).unwrap();
    let mgr = TabletManager::new(LakeConfig::default(), location.clone(), Arc::new(LocalFileSystem::new()))
        .with_block_cache(cache.clone());
    let schema = TabletSchema::new(1, KeysType::DupKeys, vec![ColumnSchema::key(0, "k", ColumnType::Int64)]);
    mgr.create_tablet(&TabletMetadata::new(42, schema)).unwrap();

    let path = location.metadata_location(42, 1);
    let mut reader = MetaFileReader::new(&path, true);
    reader.load(&mgr).unwrap();
    assert_eq!(reader.get_meta().unwrap().version, 1);
    assert!(cache.stats().mem_entries >= 1);

    // 源文件删除后仍能从缓存读出
    std::fs::remove_file(&path).unwrap();
    let mut cached = MetaFileReader::new(&path, true);
    cached.load(&mgr).unwrap();
    assert_eq!(cached.get_meta().unwrap().id, 42);
    assert!(cached.get_del_vec(&mgr, 1).unwrap().is_empty());

    let mut uncached = MetaFileReader::new(&path, false);
    assert!(uncached.load(&mgr).unwrap_err().is_not_found());
    assert!(uncached.get_meta().is_err());
}
