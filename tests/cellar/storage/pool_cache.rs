use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use cellar::cellar::db::{MetaStore, PoolStatus};
use cellar::cellar::storage::pool::PoolManager;
use cellar::cellar::storage::StorageError;
use cellar::cellar::test_support::test_output_dir;

#[test]
fn record_and_cache_agree_after_create() {
    let root = test_output_dir("pool-cache-create");
    let store = Arc::new(MetaStore::open(&root.join("metastore")).expect("open store"));
    let pools = PoolManager::new(Arc::clone(&store), root.join("storage"));

    let id = pools
        .create_and_update_cache("p1", "p1 storage pool", "mock", &HashMap::new())
        .expect("create record");
    assert!(id > 0);

    let cached = pools.get("p1").expect("get").expect("cached");
    assert_eq!(cached.status, PoolStatus::Pending);

    let record = store.pool_record("p1").expect("read").expect("persisted");
    assert_eq!(record.id, id);
    assert_eq!(record.driver, "mock");
}

#[test]
fn failed_transaction_leaves_cache_empty() {
    let root = test_output_dir("pool-cache-txfail");
    let store = Arc::new(MetaStore::open(&root.join("metastore")).expect("open store"));
    let pools = PoolManager::new(Arc::clone(&store), root.join("storage"));

    // Plant a directory where the commit stages its temp file so the
    // record can never be written.
    let staged = store.root().join("pools").join("ghost.json.tmp");
    fs::create_dir_all(&staged).expect("block staged record path");

    let error = pools
        .create_and_update_cache("ghost", "", "mock", &HashMap::new())
        .unwrap_err();
    assert!(matches!(error, StorageError::Store(_)), "got {error}");

    // The cache never ran ahead of committed state: the lookup falls
    // through to the store and finds nothing.
    assert!(pools.get("ghost").expect("get").is_none());
    assert!(store.pool_record("ghost").expect("read").is_none());
}

#[test]
fn unknown_driver_tag_fails_before_any_record() {
    let root = test_output_dir("pool-cache-unknown-driver");
    let store = Arc::new(MetaStore::open(&root.join("metastore")).expect("open store"));
    let pools = PoolManager::new(Arc::clone(&store), root.join("storage"));

    let error = pools
        .create_and_update_cache("p1", "", "warpdrive", &HashMap::new())
        .unwrap_err();
    assert!(matches!(error, StorageError::InvalidConfig(_)));
    assert!(store.pool_record("p1").expect("read").is_none());
}

#[test]
fn reserved_backend_tags_fail_before_any_record() {
    let root = test_output_dir("pool-cache-reserved-driver");
    let store = Arc::new(MetaStore::open(&root.join("metastore")).expect("open store"));
    let pools = PoolManager::new(Arc::clone(&store), root.join("storage"));

    let error = pools
        .create_and_update_cache("p1", "", "ceph", &HashMap::new())
        .unwrap_err();
    assert!(matches!(error, StorageError::Backend(_)));
    assert!(store.pool_record("p1").expect("read").is_none());
}
