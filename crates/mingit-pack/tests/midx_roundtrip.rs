//! End-to-end multi-pack index tests: build, map, look up, verify.

use std::fs;
use std::path::{Path, PathBuf};

use mingit_hash::ObjectId;
use mingit_pack::index::{write_index, PackIndexEntry};
use mingit_pack::midx::{verify_midx, MidxRegistry, MidxWriter, MultiPackIndex};
use mingit_pack::PackError;
use proptest::prelude::*;

fn oid(first: u8, last: u8) -> ObjectId {
    let mut raw = [0u8; 20];
    raw[0] = first;
    raw[19] = last;
    ObjectId::from_raw(raw)
}

/// Write a `.idx` for `pack_name` so lazy materialization and verification
/// have something to open.
fn write_pack_idx(dir: &Path, pack_name: &str, objects: &[(ObjectId, u64)]) {
    let entries: Vec<PackIndexEntry> = objects
        .iter()
        .map(|&(oid, offset)| PackIndexEntry { oid, offset, crc32: 0 })
        .collect();
    let stem = pack_name.strip_suffix(".pack").unwrap();
    write_index(dir.join(format!("{stem}.idx")), &entries, &ObjectId::NULL).unwrap();
}

/// Two packs given in reverse-sorted order, one object each.
fn build_two_pack_midx(dir: &Path) -> PathBuf {
    write_pack_idx(dir, "test-1.pack", &[(oid(0xaa, 0), 100)]);
    write_pack_idx(dir, "test-2.pack", &[(oid(0xbb, 0), 200)]);

    let mut writer = MidxWriter::new(dir);
    let p2 = writer.add_pack("test-2.pack");
    let p1 = writer.add_pack("test-1.pack");
    writer.add_object(oid(0xbb, 0), p2, 200, 0);
    writer.add_object(oid(0xaa, 0), p1, 100, 0);
    writer.write().unwrap()
}

#[test]
fn two_packs_reverse_registration() {
    let dir = tempfile::tempdir().unwrap();
    let path = build_two_pack_midx(dir.path());

    let midx = MultiPackIndex::open(&path).unwrap();
    assert_eq!(midx.num_packs(), 2);
    assert_eq!(midx.num_objects(), 2);

    // Names are sorted on disk regardless of registration order, and ids
    // follow the sorted order.
    assert_eq!(midx.pack_names(), &["test-1.pack", "test-2.pack"]);
    assert_eq!(midx.lookup(&oid(0xaa, 0)), Some((0, 100)));
    assert_eq!(midx.lookup(&oid(0xbb, 0)), Some((1, 200)));
    assert_eq!(midx.lookup(&oid(0xcc, 0)), None);

    assert!(midx.contains_pack("test-1.pack"));
    assert!(midx.contains_pack("test-2.pack"));
    assert!(!midx.contains_pack("test-3.pack"));

    // No large-offset chunk for small offsets: every offset survives as-is.
    let entries: Vec<_> = midx.iter().collect();
    assert_eq!(entries, vec![(oid(0xaa, 0), 0, 100), (oid(0xbb, 0), 1, 200)]);

    let report = verify_midx(&path, dir.path()).unwrap();
    assert!(report.is_ok(), "{report}");
}

#[test]
fn large_offset_escape_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let big = 0x1_0000_0000u64;
    write_pack_idx(dir.path(), "big.pack", &[(oid(0x01, 1), big), (oid(0x02, 2), 7)]);

    let mut writer = MidxWriter::new(dir.path());
    let p = writer.add_pack("big.pack");
    writer.add_object(oid(0x01, 1), p, big, 0);
    writer.add_object(oid(0x02, 2), p, 7, 0);
    let path = writer.write().unwrap();

    let midx = MultiPackIndex::open(&path).unwrap();
    assert_eq!(midx.lookup(&oid(0x01, 1)), Some((0, big)));
    assert_eq!(midx.lookup(&oid(0x02, 2)), Some((0, 7)));

    // The offset word for the large entry is the escape for index 0.
    let (_, _, decoded) = midx.nth(0).unwrap();
    assert_eq!(decoded, big);

    let report = verify_midx(&path, dir.path()).unwrap();
    assert!(report.is_ok(), "{report}");
}

#[test]
fn boundary_offset_uses_escape() {
    // 2^31 needs the escape even though it fits in 32 bits.
    let dir = tempfile::tempdir().unwrap();
    let boundary = 1u64 << 31;
    write_pack_idx(dir.path(), "edge.pack", &[(oid(0x01, 1), boundary)]);

    let mut writer = MidxWriter::new(dir.path());
    let p = writer.add_pack("edge.pack");
    writer.add_object(oid(0x01, 1), p, boundary, 0);
    let path = writer.write().unwrap();

    let midx = MultiPackIndex::open(&path).unwrap();
    assert_eq!(midx.lookup(&oid(0x01, 1)), Some((0, boundary)));

    let report = verify_midx(&path, dir.path()).unwrap();
    assert!(report.is_ok(), "{report}");
}

#[test]
fn duplicate_oid_keeps_oldest() {
    let dir = tempfile::tempdir().unwrap();
    write_pack_idx(dir.path(), "a.pack", &[(oid(0x10, 1), 11)]);
    write_pack_idx(dir.path(), "b.pack", &[(oid(0x10, 1), 22)]);

    let mut writer = MidxWriter::new(dir.path());
    let pa = writer.add_pack("a.pack");
    let pb = writer.add_pack("b.pack");
    // Same OID in both packs; the mtime-0 copy wins.
    writer.add_object(oid(0x10, 1), pb, 22, 5);
    writer.add_object(oid(0x10, 1), pa, 11, 0);
    let path = writer.write().unwrap();

    let midx = MultiPackIndex::open(&path).unwrap();
    assert_eq!(midx.num_objects(), 1);
    assert_eq!(midx.lookup(&oid(0x10, 1)), Some((0, 11)));
}

#[test]
fn fanout_counts_match_first_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let objects: Vec<(ObjectId, u64)> =
        vec![(oid(0x00, 1), 1), (oid(0x00, 2), 2), (oid(0x7f, 1), 3), (oid(0xff, 1), 4)];
    write_pack_idx(dir.path(), "fan.pack", &objects);

    let mut writer = MidxWriter::new(dir.path());
    let p = writer.add_pack("fan.pack");
    for &(oid, offset) in &objects {
        writer.add_object(oid, p, offset, 0);
    }
    let path = writer.write().unwrap();

    let midx = MultiPackIndex::open(&path).unwrap();
    assert_eq!(midx.num_objects(), 4);

    // nth() walks the sorted OID lookup directly.
    let oids: Vec<ObjectId> = midx.iter().map(|(o, _, _)| o).collect();
    let mut sorted = oids.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(oids, sorted);

    let report = verify_midx(&path, dir.path()).unwrap();
    assert!(report.is_ok(), "{report}");
}

#[test]
fn stale_pack_declines_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let path = build_two_pack_midx(dir.path());

    // Remove one pack's index after the MIDX was built.
    fs::remove_file(dir.path().join("test-2.idx")).unwrap();

    let midx = MultiPackIndex::open(&path).unwrap();
    // The surviving pack still answers; the stale one degrades to None.
    assert_eq!(midx.lookup(&oid(0xaa, 0)), Some((0, 100)));
    assert_eq!(midx.lookup(&oid(0xbb, 0)), None);
    // The raw entry is still present in the file.
    assert_eq!(midx.locate(&oid(0xbb, 0)), Some((1, 200)));

    // The verifier names the stale pack but keeps checking the rest.
    let report = verify_midx(&path, dir.path()).unwrap();
    assert!(!report.is_ok());
    assert!(report.violations().iter().any(|v| v.contains("test-2.pack")));
}

#[test]
fn truncated_file_is_rejected_and_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = build_two_pack_midx(dir.path());

    // Drop the byte just before the trailing hash.
    let bytes = fs::read(&path).unwrap();
    let mut truncated = bytes[..bytes.len() - 21].to_vec();
    truncated.extend_from_slice(&bytes[bytes.len() - 20..]);
    fs::write(&path, &truncated).unwrap();

    // The reader refuses to open the file.
    match MultiPackIndex::open(&path) {
        Err(PackError::ChecksumMismatch { .. }) | Err(PackError::InvalidMidx(_)) => {}
        other => panic!("expected rejection, got {:?}", other.map(|m| m.num_objects())),
    }

    // The verifier reports the checksum mismatch.
    let report = verify_midx(&path, dir.path()).unwrap();
    assert!(!report.is_ok());
    assert!(report.violations().iter().any(|v| v.contains("checksum")));
}

#[test]
fn corrupted_offset_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    let path = build_two_pack_midx(dir.path());

    // Flip the recorded offset of the first object (last byte of the first
    // OOFF record) and refresh the trailing hash so only the cross-check
    // against the pack index can notice.
    let mut bytes = fs::read(&path).unwrap();
    let ooff_pos = find_chunk_offset(&bytes, *b"OOFF");
    bytes[ooff_pos + 7] ^= 0xff;
    let hash = mingit_hash::hasher::Hasher::digest(&bytes[..bytes.len() - 20]).unwrap();
    let len = bytes.len();
    bytes[len - 20..].copy_from_slice(hash.as_bytes());
    fs::write(&path, &bytes).unwrap();

    let report = verify_midx(&path, dir.path()).unwrap();
    assert!(!report.is_ok());
    assert!(report.violations().iter().any(|v| v.contains("disagrees")));
}

fn find_chunk_offset(bytes: &[u8], id: [u8; 4]) -> usize {
    let num_chunks = bytes[11] as usize;
    for i in 0..num_chunks {
        let pos = 16 + i * 12;
        if bytes[pos..pos + 4] == id {
            let mut off = [0u8; 8];
            off.copy_from_slice(&bytes[pos + 4..pos + 12]);
            return u64::from_be_bytes(off) as usize;
        }
    }
    panic!("chunk not found");
}

#[test]
fn registry_searches_readers_in_order() {
    let dir = tempfile::tempdir().unwrap();
    build_two_pack_midx(dir.path());

    let registry = MidxRegistry::open_dir(dir.path()).unwrap();
    assert_eq!(registry.readers().len(), 1);

    let (_, pack_id, offset) = registry.lookup(&oid(0xaa, 0)).unwrap();
    assert_eq!((pack_id, offset), (0, 100));
    assert!(registry.lookup(&oid(0xdd, 0)).is_none());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Build → read reproduces exactly the deduplicated input set.
    #[test]
    fn build_read_roundtrip(
        seeds in proptest::collection::vec((any::<[u8; 20]>(), 0u64..1 << 33, 0u64..4), 1..48),
        nr_packs in 1usize..4,
    ) {
        let dir = tempfile::tempdir().unwrap();

        let mut writer = MidxWriter::new(dir.path());
        let mut pack_ids = Vec::new();
        for i in 0..nr_packs {
            pack_ids.push(writer.add_pack(format!("prop-{i}.pack")));
        }

        let mut expected: std::collections::BTreeMap<ObjectId, (u64, usize)> =
            std::collections::BTreeMap::new();
        for (i, &(raw, offset, mtime)) in seeds.iter().enumerate() {
            let oid = ObjectId::from_raw(raw);
            let pack = i % nr_packs;
            writer.add_object(oid, pack_ids[pack], offset, mtime);
            // Oldest mtime survives; earlier insertion order is irrelevant
            // because ties on (oid, mtime) are broken arbitrarily, so only
            // assert on entries with a unique minimum.
            expected
                .entry(oid)
                .and_modify(|cur| {
                    if mtime < seeds[cur.1].2 {
                        *cur = (offset, i);
                    }
                })
                .or_insert((offset, i));
        }

        let midx_path = writer.write().unwrap();
        let midx = MultiPackIndex::open(&midx_path).unwrap();

        prop_assert_eq!(midx.num_objects() as usize, expected.len());

        // Entries come back sorted and unique, and every locate() hits.
        let mut prev: Option<ObjectId> = None;
        for (oid, _, _) in midx.iter() {
            if let Some(p) = prev {
                prop_assert!(p < oid);
            }
            prev = Some(oid);
            prop_assert!(midx.locate(&oid).is_some());
        }

        for (oid, (offset, seed_idx)) in &expected {
            let unique_minimum = seeds
                .iter()
                .enumerate()
                .filter(|(i, (raw, _, _))| ObjectId::from_raw(*raw) == *oid && *i != *seed_idx)
                .all(|(_, (_, _, mtime))| *mtime > seeds[*seed_idx].2);
            if unique_minimum {
                let (_, got) = midx.locate(oid).unwrap();
                prop_assert_eq!(got, *offset);
            }
        }
    }
}
