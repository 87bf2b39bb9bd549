use std::fs;
use std::os::unix::fs::{lchown, symlink, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use cellar::cellar::idmap::shift::{shift_owner, ShiftDirection};
use cellar::cellar::idmap::{IdmapEntry, IdmapSet};
use cellar::cellar::test_support::test_output_dir;

const HOST_START: u32 = 100000;
const RANGE: u32 = 65536;
const HOLE_ID: u32 = 70000;
// Wide enough that the namespace window overlaps the host window.
const WIDE_RANGE: u32 = 500000;

fn container_set() -> IdmapSet {
    let mut set = IdmapSet::new();
    set.add(IdmapEntry {
        is_uid: true,
        is_gid: false,
        host_id: HOST_START,
        ns_id: 0,
        map_range: RANGE,
    })
    .expect("uid range");
    set.add(IdmapEntry {
        is_uid: false,
        is_gid: true,
        host_id: HOST_START,
        ns_id: 0,
        map_range: RANGE,
    })
    .expect("gid range");
    set
}

fn owner(path: &Path) -> (u32, u32) {
    let meta = fs::symlink_metadata(path).expect("inspect entry");
    (meta.uid(), meta.gid())
}

/// Chown-heavy cases need CAP_CHOWN; everything else is covered by the
/// unprivileged unit tests in the idmap module.
fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

fn build_tree(component: &str) -> PathBuf {
    let root = test_output_dir(component);
    fs::create_dir_all(root.join("home/user")).expect("dirs");
    fs::write(root.join("home/user/file"), b"payload").expect("file");
    symlink("file", root.join("home/user/link")).expect("symlink");
    root
}

#[test]
fn shift_round_trip_restores_exact_ownership() {
    if !running_as_root() {
        return;
    }

    let root = build_tree("shift-round-trip");
    let file = root.join("home/user/file");
    let link = root.join("home/user/link");
    lchown(&file, Some(1000), Some(1000)).expect("seed file owner");
    lchown(&link, Some(1000), Some(1000)).expect("seed link owner");

    // An owner outside the namespace window is a hole and must survive both
    // passes untouched.
    let hole = root.join("home/hole");
    fs::write(&hole, b"x").expect("hole file");
    lchown(&hole, Some(HOLE_ID), Some(HOLE_ID)).expect("seed hole owner");

    let set = container_set();
    let cancel = AtomicBool::new(false);

    shift_owner(&root, &set, ShiftDirection::ToNamespace, &cancel).expect("shift to namespace");
    assert_eq!(owner(&file), (HOST_START + 1000, HOST_START + 1000));
    assert_eq!(owner(&link), (HOST_START + 1000, HOST_START + 1000));
    assert_eq!(owner(&hole), (HOLE_ID, HOLE_ID));

    // Re-running the same pass is a no-op: the raw ids now sit outside the
    // namespace window.
    let changed = shift_owner(&root, &set, ShiftDirection::ToNamespace, &cancel)
        .expect("idempotent second pass");
    assert_eq!(changed, 0);

    shift_owner(&root, &set, ShiftDirection::ToHost, &cancel).expect("shift back to host");
    assert_eq!(owner(&file), (1000, 1000));
    assert_eq!(owner(&link), (1000, 1000));
    assert_eq!(owner(&hole), (HOLE_ID, HOLE_ID));
}

#[test]
fn second_pass_over_overlapping_windows_is_a_no_op() {
    if !running_as_root() {
        return;
    }

    let root = test_output_dir("shift-overlap-windows");
    let file = root.join("file");
    fs::write(&file, b"x").expect("file");
    lchown(&file, Some(1000), Some(1000)).expect("seed owner");

    let mut set = IdmapSet::new();
    for is_uid in [true, false] {
        set.add(IdmapEntry {
            is_uid,
            is_gid: !is_uid,
            host_id: HOST_START,
            ns_id: 0,
            map_range: WIDE_RANGE,
        })
        .expect("wide range");
    }
    let cancel = AtomicBool::new(false);

    shift_owner(&root, &set, ShiftDirection::ToNamespace, &cancel).expect("first pass");
    assert_eq!(owner(&file), (HOST_START + 1000, HOST_START + 1000));

    // The shifted ids land back inside the namespace window; they must
    // still be recognized as shifted instead of moving again.
    let changed = shift_owner(&root, &set, ShiftDirection::ToNamespace, &cancel)
        .expect("second pass");
    assert_eq!(changed, 0);
    assert_eq!(owner(&file), (HOST_START + 1000, HOST_START + 1000));

    shift_owner(&root, &set, ShiftDirection::ToHost, &cancel).expect("restore");
    assert_eq!(owner(&file), (1000, 1000));
}

#[test]
fn symlink_targets_are_never_followed() {
    if !running_as_root() {
        return;
    }

    let root = build_tree("shift-symlink");
    let file = root.join("home/user/file");
    let link = root.join("home/user/link");
    lchown(&file, Some(1000), Some(1000)).expect("seed file owner");
    // Link owner differs from its target.
    lchown(&link, Some(2000), Some(2000)).expect("seed link owner");

    let set = container_set();
    let cancel = AtomicBool::new(false);
    shift_owner(&root, &set, ShiftDirection::ToNamespace, &cancel).expect("shift");

    assert_eq!(owner(&link), (HOST_START + 2000, HOST_START + 2000));
    assert_eq!(owner(&file), (HOST_START + 1000, HOST_START + 1000));
}
