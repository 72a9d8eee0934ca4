//! Multi-pack index verification.
//!
//! Re-derives every format invariant from a fresh mapping of the file and
//! cross-checks each entry against the underlying pack indexes. Violations
//! are collected rather than aborting at the first, so one run reports
//! everything that is wrong.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use memmap2::Mmap;
use mingit_hash::hasher::Hasher;
use mingit_hash::{ObjectId, OID_RAW_LEN};
use tracing::debug;

use crate::chunk::ChunkTable;
use crate::index::PackIndex;
use crate::midx::idx_path_for_pack;
use crate::{
    PackError, CHUNK_LARGE_OFFSETS, CHUNK_OBJECT_OFFSETS, CHUNK_OID_FANOUT, CHUNK_OID_LOOKUP,
    CHUNK_PACK_LOOKUP, CHUNK_PACK_NAMES, MIDX_HASH_VERSION, MIDX_HEADER_SIZE,
    MIDX_LARGE_OFFSET_NEEDED, MIDX_SIGNATURE, MIDX_VERSION,
};

/// Outcome of a verification run.
#[derive(Debug, Default)]
pub struct VerifyReport {
    violations: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    fn report(&mut self, violation: impl Into<String>) {
        self.violations.push(violation.into());
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            write!(f, "multi-pack index verified")
        } else {
            for v in &self.violations {
                writeln!(f, "{v}")?;
            }
            write!(f, "{} violation(s)", self.violations.len())
        }
    }
}

/// Verify the MIDX at `midx_path` against the packs in `pack_dir`.
///
/// I/O errors opening or mapping the file itself propagate; everything
/// derivable from the mapped bytes lands in the report. A pack whose index
/// is missing or unreadable is reported once and its per-object checks are
/// skipped (the reader would decline those lookups; the verifier names the
/// pack instead).
pub fn verify_midx(midx_path: &Path, pack_dir: &Path) -> Result<VerifyReport, PackError> {
    let mut report = VerifyReport::default();

    let file = std::fs::File::open(midx_path)?;
    let data = unsafe { Mmap::map(&file)? };

    if data.len() < MIDX_HEADER_SIZE + OID_RAW_LEN {
        report.report(format!("{}: file too small", midx_path.display()));
        return Ok(report);
    }

    // Trailing checksum over everything before it.
    match (
        ObjectId::from_bytes(&data[data.len() - OID_RAW_LEN..]),
        Hasher::digest(&data[..data.len() - OID_RAW_LEN]),
    ) {
        (Ok(stored), Ok(actual)) if stored != actual => {
            report.report(format!("checksum mismatch: expected {stored}, got {actual}"));
        }
        (Err(e), _) | (_, Err(e)) => report.report(format!("checksum unreadable: {e}")),
        _ => {}
    }

    if &data[0..4] != MIDX_SIGNATURE {
        report.report("bad signature".to_string());
        return Ok(report);
    }
    let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if version != MIDX_VERSION {
        report.report(format!("unsupported version {version:#x}"));
        return Ok(report);
    }
    if data[8] != MIDX_HASH_VERSION {
        report.report(format!("unsupported hash version {}", data[8]));
    }
    if data[9] as usize != OID_RAW_LEN {
        report.report(format!("unsupported hash length {}", data[9]));
    }
    if data[10] != 0 {
        report.report(format!("nonzero base midx count {}", data[10]));
    }
    let num_chunks = data[11] as usize;
    let num_packs = u32::from_be_bytes([data[12], data[13], data[14], data[15]]) as usize;

    let table = match ChunkTable::parse(&data, MIDX_HEADER_SIZE, num_chunks) {
        Ok(table) => table,
        Err(err) => {
            report.report(format!("chunk table: {err}"));
            return Ok(report);
        }
    };

    let mut chunk = |id: u32, name: &'static str| match table.required(id, name) {
        Ok(range) => Some(range),
        Err(err) => {
            report.report(err.to_string());
            None
        }
    };
    let pack_lookup = chunk(CHUNK_PACK_LOOKUP, "PLOO");
    let pack_names_chunk = chunk(CHUNK_PACK_NAMES, "PNAM");
    let fanout = chunk(CHUNK_OID_FANOUT, "OIDF");
    let oid_lookup = chunk(CHUNK_OID_LOOKUP, "OIDL");
    let object_offsets = chunk(CHUNK_OBJECT_OFFSETS, "OOFF");
    let large_offsets = table.range(CHUNK_LARGE_OFFSETS);

    let (Some(pack_lookup), Some(pack_names_chunk), Some(fanout), Some(oid_lookup), Some(object_offsets)) =
        (pack_lookup, pack_names_chunk, fanout, oid_lookup, object_offsets)
    else {
        return Ok(report);
    };

    // Pack names: strictly increasing PLOO offsets, sorted NUL-terminated names.
    let mut pack_names: Vec<Option<String>> = vec![None; num_packs];
    if pack_lookup.len() < num_packs * 4 {
        report.report("pack lookup chunk shorter than pack count".to_string());
    } else {
        let mut prev_offset: Option<u32> = None;
        for (i, name_slot) in pack_names.iter_mut().enumerate() {
            let pos = pack_lookup.start + i * 4;
            let offset =
                u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
            if let Some(prev) = prev_offset {
                if offset <= prev {
                    report.report(format!("pack name offset {i} not strictly increasing"));
                }
            }
            prev_offset = Some(offset);

            let start = pack_names_chunk.start + offset as usize;
            if start >= pack_names_chunk.end {
                report.report(format!("pack name offset {i} out of range"));
                continue;
            }
            match data[start..pack_names_chunk.end].iter().position(|&b| b == 0) {
                Some(nul) => match std::str::from_utf8(&data[start..start + nul]) {
                    Ok(name) => *name_slot = Some(name.to_string()),
                    Err(_) => report.report(format!("pack name {i} is not valid UTF-8")),
                },
                None => report.report(format!("pack name {i} unterminated")),
            }
        }
        for i in 1..num_packs {
            if let (Some(a), Some(b)) = (&pack_names[i - 1], &pack_names[i]) {
                if a >= b {
                    report.report(format!("pack names out of order: {a:?} before {b:?}"));
                }
            }
        }
    }

    // Fan-out: entry i counts OIDs with first byte ≤ i; OID lookup strictly
    // ascending.
    if fanout.len() < 256 * 4 {
        report.report("fan-out chunk truncated".to_string());
        return Ok(report);
    }
    let fanout_entry = |i: usize| -> u32 {
        let pos = fanout.start + i * 4;
        u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
    };
    let num_objects = fanout_entry(255) as usize;

    if oid_lookup.len() < num_objects * OID_RAW_LEN {
        report.report("OID lookup chunk shorter than fan-out total".to_string());
        return Ok(report);
    }
    if object_offsets.len() < num_objects * 8 {
        report.report("object offsets chunk shorter than fan-out total".to_string());
        return Ok(report);
    }

    let oid_at = |i: usize| {
        let start = oid_lookup.start + i * OID_RAW_LEN;
        &data[start..start + OID_RAW_LEN]
    };

    let mut counts = [0u32; 256];
    for i in 0..num_objects {
        counts[oid_at(i)[0] as usize] += 1;
        if i > 0 && oid_at(i - 1) >= oid_at(i) {
            report.report(format!("OID lookup not strictly ascending at position {i}"));
        }
    }
    let mut cumulative = 0u32;
    for (i, &count) in counts.iter().enumerate() {
        cumulative += count;
        if fanout_entry(i) != cumulative {
            report.report(format!(
                "fan-out[{i}] is {}, expected {cumulative}",
                fanout_entry(i)
            ));
        }
    }

    // Per-object cross-check against the underlying pack indexes.
    let nr_large = large_offsets.as_ref().map(|r| r.len() / 8).unwrap_or(0);
    let mut opened: HashMap<u32, Option<PackIndex>> = HashMap::new();

    for i in 0..num_objects {
        let pos = object_offsets.start + i * 8;
        let pack_id =
            u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        let word = u32::from_be_bytes([
            data[pos + 4],
            data[pos + 5],
            data[pos + 6],
            data[pos + 7],
        ]);
        let oid = ObjectId::from_bytes(oid_at(i)).expect("fixed-width slice");

        if pack_id as usize >= num_packs {
            report.report(format!("object {oid}: pack id {pack_id} out of range"));
            continue;
        }

        let offset = if word & MIDX_LARGE_OFFSET_NEEDED != 0 {
            let idx = (word & !MIDX_LARGE_OFFSET_NEEDED) as usize;
            if idx >= nr_large {
                report.report(format!("object {oid}: large offset escape {idx} out of range"));
                continue;
            }
            let large = large_offsets.as_ref().expect("escape implies chunk");
            let p = large.start + idx * 8;
            u64::from_be_bytes([
                data[p],
                data[p + 1],
                data[p + 2],
                data[p + 3],
                data[p + 4],
                data[p + 5],
                data[p + 6],
                data[p + 7],
            ])
        } else {
            word as u64
        };

        let pack = opened.entry(pack_id).or_insert_with(|| {
            let Some(name) = pack_names.get(pack_id as usize).and_then(Clone::clone) else {
                return None;
            };
            let path = idx_path_for_pack(pack_dir, &name);
            match PackIndex::open(&path) {
                Ok(idx) => Some(idx),
                Err(err) => {
                    report.report(format!("pack '{name}': cannot open index: {err}"));
                    None
                }
            }
        });

        let Some(pack) = pack else { continue };
        match pack.lookup(&oid) {
            Some(pack_offset) if pack_offset == offset => {}
            Some(pack_offset) => report.report(format!(
                "object {oid}: offset {offset} disagrees with pack index ({pack_offset})"
            )),
            None => report.report(format!("object {oid}: missing from its pack index")),
        }
    }

    debug!(
        path = %midx_path.display(),
        objects = num_objects,
        violations = report.violations().len(),
        "verified multi-pack index"
    );
    Ok(report)
}
