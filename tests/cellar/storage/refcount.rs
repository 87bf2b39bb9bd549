use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use cellar::cellar::db::MetaStore;
use cellar::cellar::storage::mock::MockDriver;
use cellar::cellar::storage::pool::PoolManager;
use cellar::cellar::storage::volume::{VolumeController, VolumeType};
use cellar::cellar::storage::{StorageError, StorageType};
use cellar::cellar::test_support::test_output_dir;

fn setup(component: &str) -> (Arc<PoolManager>, VolumeController) {
    let root = test_output_dir(component);
    let store = Arc::new(MetaStore::open(&root.join("metastore")).expect("open store"));
    let pools = Arc::new(PoolManager::new(store, root.join("storage")));
    let volumes = VolumeController::new(Arc::clone(&pools));
    (pools, volumes)
}

fn mock_operations(pools: &PoolManager, op: &str) -> usize {
    let driver = pools.driver_for(StorageType::Mock).expect("mock driver");
    let mock = driver
        .as_any()
        .downcast_ref::<MockDriver>()
        .expect("mock driver instance");
    mock.operations()
        .iter()
        .filter(|entry| entry.starts_with(op))
        .count()
}

#[test]
fn double_mount_and_unmount_reach_the_driver_exactly_once() {
    let (pools, volumes) = setup("refcount-law");
    pools
        .create_pool("p1", "", "mock", &HashMap::new())
        .expect("pool");
    volumes
        .create_volume("p1", "v1", VolumeType::Custom, 1 << 20, None)
        .expect("volume");

    let first = volumes.mount("p1", "v1").expect("first mount");
    let second = volumes.mount("p1", "v1").expect("second mount");
    assert_eq!(first, second, "nested mounts must share one path");
    assert!(volumes.is_mounted("p1", "v1"));
    assert_eq!(mock_operations(&pools, "mount_volume p1/v1"), 1);

    assert!(!volumes.unmount("p1", "v1").expect("first unmount"));
    assert!(volumes.is_mounted("p1", "v1"), "one reference remains");

    assert!(volumes.unmount("p1", "v1").expect("second unmount"));
    assert!(!volumes.is_mounted("p1", "v1"));
    assert_eq!(mock_operations(&pools, "unmount_volume p1/v1"), 1);
}

#[test]
fn surplus_unmounts_are_a_no_op() {
    let (pools, volumes) = setup("refcount-surplus");
    pools
        .create_pool("p1", "", "mock", &HashMap::new())
        .expect("pool");
    volumes
        .create_volume("p1", "v1", VolumeType::Custom, 0, None)
        .expect("volume");

    assert!(!volumes.unmount("p1", "v1").expect("never mounted"));

    volumes.mount("p1", "v1").expect("mount");
    assert!(volumes.unmount("p1", "v1").expect("real unmount"));
    assert!(!volumes.unmount("p1", "v1").expect("extra unmount"));
    assert!(!volumes.unmount("p1", "v1").expect("still a no-op"));
    assert_eq!(mock_operations(&pools, "unmount_volume p1/v1"), 1);
}

#[test]
fn mounts_on_distinct_pools_proceed_independently() {
    let (pools, volumes) = setup("refcount-parallel");
    let volumes = Arc::new(volumes);
    for pool in ["p1", "p2"] {
        pools
            .create_pool(pool, "", "mock", &HashMap::new())
            .expect("pool");
        volumes
            .create_volume(pool, "v", VolumeType::Custom, 0, None)
            .expect("volume");
    }

    let mut workers = Vec::new();
    for pool in ["p1", "p2"] {
        let volumes = Arc::clone(&volumes);
        workers.push(thread::spawn(move || {
            for _ in 0..50 {
                volumes.mount(pool, "v").expect("mount");
                volumes.mount(pool, "v").expect("nested mount");
                assert!(!volumes.unmount(pool, "v").expect("inner unmount"));
                assert!(volumes.unmount(pool, "v").expect("final unmount"));
            }
        }));
    }
    for worker in workers {
        worker.join().expect("worker");
    }

    // Each cycle reaches the driver exactly once per direction, regardless
    // of interleaving with the other pool.
    for pool in ["p1", "p2"] {
        assert!(!volumes.is_mounted(pool, "v"));
        assert_eq!(
            mock_operations(&pools, &format!("mount_volume {}/v", pool)),
            50
        );
        assert_eq!(
            mock_operations(&pools, &format!("unmount_volume {}/v", pool)),
            50
        );
    }
}

#[test]
fn failed_driver_mount_leaves_refcount_at_zero() {
    let (pools, volumes) = setup("refcount-mount-failure");
    pools
        .create_pool("p1", "", "mock", &HashMap::new())
        .expect("pool");

    let error = volumes.mount("p1", "missing").unwrap_err();
    assert!(matches!(error, StorageError::NotFound(_)));
    assert!(!volumes.is_mounted("p1", "missing"));
}

#[test]
fn mounted_volume_cannot_be_deleted() {
    let (pools, volumes) = setup("refcount-delete-guard");
    pools
        .create_pool("p1", "", "mock", &HashMap::new())
        .expect("pool");
    volumes
        .create_volume("p1", "v1", VolumeType::Custom, 0, None)
        .expect("volume");
    volumes.mount("p1", "v1").expect("mount");

    let error = volumes.delete_volume("p1", "v1").unwrap_err();
    assert!(matches!(error, StorageError::InUse(_)));

    volumes.unmount("p1", "v1").expect("unmount");
    volumes.delete_volume("p1", "v1").expect("delete after unmount");
}
