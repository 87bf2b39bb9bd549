use std::collections::HashMap;
use std::fs;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use cellar::cellar::db::{MetaStore, PoolStatus};
use cellar::cellar::idmap::{IdmapEntry, IdmapSet};
use cellar::cellar::storage::pool::PoolManager;
use cellar::cellar::storage::volume::{VolumeController, VolumeType};
use cellar::cellar::storage::StorageError;
use cellar::cellar::test_support::test_output_dir;

fn setup(component: &str) -> (Arc<PoolManager>, VolumeController) {
    let root = test_output_dir(component);
    let store = Arc::new(MetaStore::open(&root.join("metastore")).expect("open store"));
    let pools = Arc::new(PoolManager::new(store, root.join("storage")));
    let volumes = VolumeController::new(Arc::clone(&pools));
    (pools, volumes)
}

#[test]
fn mock_pool_end_to_end_scenario() {
    let (pools, volumes) = setup("lifecycle-mock-e2e");

    pools
        .create_pool("p1", "p1 storage pool", "mock", &HashMap::new())
        .expect("create pool");
    let pool = pools.get("p1").expect("get").expect("present");
    assert_eq!(pool.status, PoolStatus::Created);

    volumes
        .create_volume("p1", "v1", VolumeType::Custom, 1 << 20, None)
        .expect("create volume");

    let path = volumes.mount("p1", "v1").expect("mount");
    assert!(volumes.is_mounted("p1", "v1"));

    let again = volumes.mount("p1", "v1").expect("nested mount");
    assert_eq!(path, again);

    assert!(!volumes.unmount("p1", "v1").expect("first unmount"));
    assert!(volumes.is_mounted("p1", "v1"));
    assert!(volumes.unmount("p1", "v1").expect("second unmount"));
    assert!(!volumes.is_mounted("p1", "v1"));
}

#[test]
fn pool_with_volumes_cannot_be_deleted() {
    let (pools, volumes) = setup("lifecycle-delete-guard");
    pools
        .create_pool("p1", "", "mock", &HashMap::new())
        .expect("pool");
    volumes
        .create_volume("p1", "v1", VolumeType::Custom, 0, None)
        .expect("volume");

    let error = pools.delete_pool("p1").unwrap_err();
    assert!(matches!(error, StorageError::InUse(_)));

    volumes.delete_volume("p1", "v1").expect("delete volume");
    pools.delete_pool("p1").expect("delete empty pool");
    assert!(pools.get("p1").expect("get").is_none());
}

#[test]
fn snapshot_clone_and_resize_on_the_dir_backend() {
    let (pools, volumes) = setup("lifecycle-dir");
    pools
        .create_pool("p1", "dir pool", "dir", &HashMap::new())
        .expect("pool");
    volumes
        .create_volume("p1", "v1", VolumeType::Custom, 1 << 20, None)
        .expect("volume");

    let mount = volumes.mount("p1", "v1").expect("mount");
    fs::write(mount.join("state"), b"generation-1").expect("seed data");
    volumes.snapshot_volume("p1", "v1", "snap0").expect("snapshot");
    fs::write(mount.join("state"), b"generation-2").expect("mutate data");
    assert_eq!(
        volumes.volume_snapshots("p1", "v1").expect("list"),
        vec!["snap0".to_string()]
    );

    volumes
        .create_volume("p1", "v2", VolumeType::Custom, 1 << 20, Some("v1@snap0"))
        .expect("clone from snapshot");
    let clone_mount = volumes.mount("p1", "v2").expect("mount clone");
    assert_eq!(
        fs::read(clone_mount.join("state")).expect("read clone"),
        b"generation-1"
    );

    volumes
        .resize_volume("p1", "v2", 2 << 20)
        .expect("resize clone");
    let record = pools
        .store()
        .volume_record("p1", "v2")
        .expect("read record")
        .expect("record");
    assert_eq!(record.config.get("size").map(String::as_str), Some("2097152"));
}

fn identity_idmap() -> IdmapSet {
    let uid = nix::unistd::Uid::effective().as_raw();
    let gid = nix::unistd::Gid::effective().as_raw();
    let mut set = IdmapSet::new();
    set.add(IdmapEntry {
        is_uid: true,
        is_gid: false,
        host_id: uid,
        ns_id: uid,
        map_range: 1,
    })
    .expect("uid range");
    set.add(IdmapEntry {
        is_uid: false,
        is_gid: true,
        host_id: gid,
        ns_id: gid,
        map_range: 1,
    })
    .expect("gid range");
    set
}

#[test]
fn container_root_provisioning_and_teardown() {
    let (pools, volumes) = setup("lifecycle-provision");
    pools
        .create_pool("default", "root pool", "dir", &HashMap::new())
        .expect("pool");

    let mut root_dev = HashMap::new();
    root_dev.insert("type".to_string(), "disk".to_string());
    root_dev.insert("path".to_string(), "/".to_string());
    root_dev.insert("pool".to_string(), "default".to_string());
    let mut devices = HashMap::new();
    devices.insert("root".to_string(), root_dev);

    let idmap = identity_idmap();
    let cancel = AtomicBool::new(false);

    let path = volumes
        .provision_container_root("c1", &devices, Some(&idmap), &cancel)
        .expect("provision");
    assert!(path.is_dir());
    assert!(volumes.is_mounted("default", "c1"));
    fs::write(path.join("etc-hostname"), b"c1").expect("write into rootfs");

    volumes
        .teardown_container_root("c1", &devices, Some(&idmap), &cancel)
        .expect("teardown");
    assert!(!volumes.is_mounted("default", "c1"));
    assert!(
        pools
            .store()
            .volume_record("default", "c1")
            .expect("read")
            .is_none(),
        "backing volume record must be gone"
    );
}

#[test]
fn provisioning_without_root_device_fails_fast() {
    let (_pools, volumes) = setup("lifecycle-no-root-device");
    let devices = HashMap::new();
    let cancel = AtomicBool::new(false);
    assert!(volumes
        .provision_container_root("c1", &devices, None, &cancel)
        .is_err());
}
