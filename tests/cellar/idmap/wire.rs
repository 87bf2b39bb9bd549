use cellar::cellar::idmap::{IdmapEntry, IdmapError, IdmapSet};

fn sample_set() -> IdmapSet {
    let mut set = IdmapSet::new();
    set.add(IdmapEntry {
        is_uid: true,
        is_gid: false,
        host_id: 100000,
        ns_id: 0,
        map_range: 500000,
    })
    .expect("uid range");
    set.add(IdmapEntry {
        is_uid: false,
        is_gid: true,
        host_id: 100000,
        ns_id: 0,
        map_range: 500000,
    })
    .expect("gid range");
    set
}

#[test]
fn wire_round_trip_preserves_the_set() {
    let set = sample_set();
    let wire = set.to_wire();
    let decoded = IdmapSet::parse_wire(&wire).expect("parse");
    assert_eq!(decoded, set);
}

#[test]
fn equal_sets_serialize_byte_identically() {
    assert_eq!(sample_set().to_wire(), sample_set().to_wire());
}

#[test]
fn field_order_is_stable_within_a_record() {
    let wire = sample_set().to_wire();
    let first_line = wire.lines().next().expect("one record per line");
    let positions: Vec<usize> = ["is_uid", "is_gid", "host_id", "ns_id", "map_range"]
        .iter()
        .map(|field| first_line.find(field).expect("field present"))
        .collect();
    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted, "wire field order changed: {first_line}");
}

#[test]
fn malformed_records_report_the_line() {
    let error = IdmapSet::parse_wire("not-json\n").unwrap_err();
    match error {
        IdmapError::Wire { line, .. } => assert_eq!(line, 1),
        other => panic!("expected Wire error, got {other}"),
    }
}

#[test]
fn overlapping_persisted_ranges_are_rejected() {
    let mut wire = String::new();
    for _ in 0..2 {
        wire.push_str(
            "{\"is_uid\":true,\"is_gid\":false,\"host_id\":100000,\"ns_id\":0,\"map_range\":10}\n",
        );
    }
    let error = IdmapSet::parse_wire(&wire).unwrap_err();
    assert!(matches!(error, IdmapError::Wire { line: 2, .. }));
}

#[test]
fn blank_lines_are_ignored() {
    let set = sample_set();
    let padded = format!("\n{}\n\n", set.to_wire());
    assert_eq!(IdmapSet::parse_wire(&padded).expect("parse"), set);
}
