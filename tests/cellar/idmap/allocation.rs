use cellar::cellar::idmap::{HostRangePool, IdKind, IdmapEntry, IdmapError, IdmapSet};

const POOL_START: u32 = 100000;
const POOL_LENGTH: u32 = 400000;

fn fresh_pool() -> HostRangePool {
    HostRangePool::new(POOL_START, POOL_LENGTH, POOL_START, POOL_LENGTH)
        .expect("pool above the reserved host range")
}

#[test]
fn pool_of_size_n_yields_exactly_n_even_allocations() {
    let pool = fresh_pool();
    let slots = 4;
    let slot_length = POOL_LENGTH / slots;

    let mut allocated = Vec::new();
    for _ in 0..slots {
        allocated.push(
            pool.allocate(IdKind::Uid, slot_length)
                .expect("allocation within capacity"),
        );
    }

    let error = pool.allocate(IdKind::Uid, slot_length).unwrap_err();
    assert!(
        matches!(error, IdmapError::Exhausted { kind: IdKind::Uid, .. }),
        "expected Exhausted, got {error}"
    );

    // Releasing everything coalesces back into one full-size interval.
    for entry in &allocated {
        pool.release(entry).expect("release allocated range");
    }
    assert_eq!(pool.free_spans(IdKind::Uid), vec![(POOL_START, POOL_LENGTH)]);
    pool.allocate(IdKind::Uid, POOL_LENGTH)
        .expect("full-size allocation after coalescing");
}

#[test]
fn out_of_order_release_still_coalesces() {
    let pool = fresh_pool();
    let a = pool.allocate(IdKind::Gid, 1000).expect("a");
    let b = pool.allocate(IdKind::Gid, 1000).expect("b");
    let c = pool.allocate(IdKind::Gid, 1000).expect("c");

    pool.release(&a).expect("release a");
    pool.release(&c).expect("release c");
    pool.release(&b).expect("release b");

    assert_eq!(pool.free_spans(IdKind::Gid), vec![(POOL_START, POOL_LENGTH)]);
}

#[test]
fn releasing_a_foreign_range_fails_with_not_owned() {
    let pool = fresh_pool();
    let foreign = IdmapEntry {
        is_uid: true,
        is_gid: false,
        host_id: POOL_START,
        ns_id: 0,
        map_range: 512,
    };
    let error = pool.release(&foreign).unwrap_err();
    assert!(matches!(error, IdmapError::NotOwned { .. }));

    // Releasing the same range twice degenerates to the same failure.
    let owned = pool.allocate(IdKind::Uid, 512).expect("allocate");
    pool.release(&owned).expect("first release");
    assert!(matches!(
        pool.release(&owned).unwrap_err(),
        IdmapError::NotOwned { .. }
    ));
}

#[test]
fn allocated_sets_from_one_pool_never_intersect() {
    let pool = fresh_pool();
    let first = pool.allocate_set(65536).expect("first set");
    let second = pool.allocate_set(65536).expect("second set");

    assert!(!first.intersects(&second));
    assert!(!second.intersects(&first));
}

#[test]
fn a_set_always_intersects_its_own_ranges() {
    let pool = fresh_pool();
    let set = pool.allocate_set(65536).expect("set");

    for entry in set.entries() {
        let mut singleton = IdmapSet::new();
        singleton.add(*entry).expect("well-formed entry");
        assert!(set.intersects(&singleton));
    }
}

#[test]
fn released_set_ranges_become_allocatable_again() {
    let pool = fresh_pool();
    let set = pool.allocate_set(POOL_LENGTH).expect("whole pool");
    assert!(matches!(
        pool.allocate(IdKind::Uid, 1).unwrap_err(),
        IdmapError::Exhausted { .. }
    ));

    pool.release_set(&set).expect("release set");
    pool.allocate(IdKind::Uid, POOL_LENGTH).expect("whole pool again");
}
