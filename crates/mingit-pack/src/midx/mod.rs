//! Multi-pack index (MIDX) support.
//!
//! A MIDX aggregates the OID → (pack, offset) mappings of many packs into a
//! single chunked file. Layout:
//!
//! ```text
//! Header (16 bytes):
//!   signature "MIDX" (4) | version (4) | hash version (1) | hash length (1)
//!   | base midx count (1) | chunk count (1) | pack count (4)
//! Chunk lookup table: [id (4) | offset (8)] × num_chunks + zero sentinel
//! Chunks:
//!   PLOO — per-pack offsets into the pack-name chunk
//!   PNAM — null-terminated pack names, sorted
//!   OIDF — 256 × 4-byte cumulative fan-out counts
//!   OIDL — N × 20-byte sorted distinct OIDs
//!   OOFF — N × (pack id (4) | offset-or-escape (4))
//!   LOFF — 8-byte offsets, present iff any offset ≥ 2^31
//! Trailer: 20-byte hash of everything above
//! ```

mod verify;
pub mod write;

pub use verify::{verify_midx, VerifyReport};
pub use write::{MidxEntry, MidxWriter};

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use memmap2::Mmap;
use mingit_hash::hasher::Hasher;
use mingit_hash::{ObjectId, OID_RAW_LEN};
use tracing::debug;

use crate::chunk::ChunkTable;
use crate::index::PackIndex;
use crate::{
    PackError, CHUNK_LARGE_OFFSETS, CHUNK_OBJECT_OFFSETS, CHUNK_OID_FANOUT, CHUNK_OID_LOOKUP,
    CHUNK_PACK_LOOKUP, CHUNK_PACK_NAMES, MIDX_HASH_VERSION, MIDX_HEADER_SIZE,
    MIDX_LARGE_OFFSET_NEEDED, MIDX_SIGNATURE, MIDX_VERSION,
};

/// Derive the `.idx` path for a pack name recorded in a MIDX.
pub(crate) fn idx_path_for_pack(pack_dir: &Path, pack_name: &str) -> PathBuf {
    let stem = pack_name.strip_suffix(".pack").unwrap_or(pack_name);
    pack_dir.join(format!("{stem}.idx"))
}

/// Memory-mapped multi-pack index reader.
///
/// Owns its map and the lazily materialized pack-index handles; all are
/// released together on drop. Pack handles are shared out as `Arc`, and each
/// slot is published through a `OnceLock` so concurrent lookups never observe
/// a torn write.
pub struct MultiPackIndex {
    data: Mmap,
    midx_path: PathBuf,
    pack_dir: PathBuf,
    num_packs: u32,
    num_objects: u32,
    pack_names: Vec<String>,
    oid_lookup: Range<usize>,
    object_offsets: Range<usize>,
    large_offsets: Option<Range<usize>>,
    fanout: Range<usize>,
    pack_slots: Vec<OnceLock<Option<Arc<PackIndex>>>>,
}

impl MultiPackIndex {
    /// Open a multi-pack index, validating the header, chunk table, required
    /// chunks, and trailing checksum.
    pub fn open(midx_path: impl AsRef<Path>) -> Result<Self, PackError> {
        let midx_path = midx_path.as_ref().to_path_buf();
        let pack_dir = midx_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file = std::fs::File::open(&midx_path)?;
        let data = unsafe { Mmap::map(&file)? };

        if data.len() < MIDX_HEADER_SIZE + OID_RAW_LEN {
            return Err(PackError::InvalidMidx(format!(
                "{}: file too small",
                midx_path.display()
            )));
        }
        if &data[0..4] != MIDX_SIGNATURE {
            return Err(PackError::InvalidMidx(format!(
                "{}: bad signature",
                midx_path.display()
            )));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != MIDX_VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }
        if data[8] != MIDX_HASH_VERSION {
            return Err(PackError::InvalidMidx(format!(
                "unsupported hash version {}",
                data[8]
            )));
        }
        if data[9] as usize != OID_RAW_LEN {
            return Err(PackError::InvalidMidx(format!(
                "unsupported hash length {}",
                data[9]
            )));
        }
        if data[10] != 0 {
            return Err(PackError::InvalidMidx(format!(
                "unsupported base midx count {}",
                data[10]
            )));
        }
        let num_chunks = data[11] as usize;
        let num_packs = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);

        // Refuse files whose trailing checksum does not match; a truncated or
        // bitrotted index must never serve lookups.
        let content = &data[..data.len() - OID_RAW_LEN];
        let stored = ObjectId::from_bytes(&data[data.len() - OID_RAW_LEN..])
            .map_err(PackError::Hash)?;
        let actual = Hasher::digest(content)?;
        if stored != actual {
            return Err(PackError::ChecksumMismatch { expected: stored, actual });
        }

        let table = ChunkTable::parse(&data, MIDX_HEADER_SIZE, num_chunks)?;

        let pack_lookup = table.required(CHUNK_PACK_LOOKUP, "PLOO")?;
        let pack_names_chunk = table.required(CHUNK_PACK_NAMES, "PNAM")?;
        let fanout = table.required(CHUNK_OID_FANOUT, "OIDF")?;
        let oid_lookup = table.required(CHUNK_OID_LOOKUP, "OIDL")?;
        let object_offsets = table.required(CHUNK_OBJECT_OFFSETS, "OOFF")?;
        let large_offsets = table.range(CHUNK_LARGE_OFFSETS);

        if fanout.len() < 256 * 4 {
            return Err(PackError::InvalidMidx("truncated fan-out chunk".into()));
        }
        let last = fanout.start + 255 * 4;
        let num_objects = u32::from_be_bytes([
            data[last],
            data[last + 1],
            data[last + 2],
            data[last + 3],
        ]);

        if oid_lookup.len() < num_objects as usize * OID_RAW_LEN {
            return Err(PackError::InvalidMidx("truncated OID lookup chunk".into()));
        }
        if object_offsets.len() < num_objects as usize * 8 {
            return Err(PackError::InvalidMidx("truncated object offsets chunk".into()));
        }
        if pack_lookup.len() < num_packs as usize * 4 {
            return Err(PackError::InvalidMidx("truncated pack lookup chunk".into()));
        }

        let pack_names =
            parse_pack_names(&data, &pack_lookup, &pack_names_chunk, num_packs as usize)?;

        let mut pack_slots = Vec::with_capacity(num_packs as usize);
        pack_slots.resize_with(num_packs as usize, OnceLock::new);

        Ok(Self {
            data,
            midx_path,
            pack_dir,
            num_packs,
            num_objects,
            pack_names,
            oid_lookup,
            object_offsets,
            large_offsets,
            fanout,
            pack_slots,
        })
    }

    /// Number of distinct objects.
    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    /// Number of packs referenced.
    pub fn num_packs(&self) -> u32 {
        self.num_packs
    }

    /// Referenced pack names, sorted.
    pub fn pack_names(&self) -> &[String] {
        &self.pack_names
    }

    /// Path of the mapped file.
    pub fn path(&self) -> &Path {
        &self.midx_path
    }

    /// Is `name` one of the packs this index covers?
    pub fn contains_pack(&self, name: &str) -> bool {
        self.pack_names.binary_search_by(|n| n.as_str().cmp(name)).is_ok()
    }

    /// Find an OID, returning `(pack id, offset)`.
    ///
    /// The referenced pack index is materialized on first use. If the pack
    /// has disappeared since the index was written the lookup is declined so
    /// the caller can fall through to another object source.
    pub fn lookup(&self, oid: &ObjectId) -> Option<(u32, u64)> {
        let (pack_id, offset) = self.locate(oid)?;
        self.pack_index(pack_id)?;
        Some((pack_id, offset))
    }

    /// Find an OID without touching the pack, returning `(pack id, offset)`.
    pub fn locate(&self, oid: &ObjectId) -> Option<(u32, u64)> {
        let range = self.fanout_range(oid.first_byte());
        let target = oid.as_bytes();

        let mut low = range.start;
        let mut high = range.end;
        while low < high {
            let mid = low + (high - low) / 2;
            match self.oid_bytes_at(mid).cmp(target) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Some(self.object_entry(mid)),
            }
        }
        None
    }

    /// Entry at sorted position `i`: `(oid, pack id, offset)`.
    pub fn nth(&self, i: u32) -> Option<(ObjectId, u32, u64)> {
        if i >= self.num_objects {
            return None;
        }
        let oid = ObjectId::from_bytes(self.oid_bytes_at(i as usize)).expect("valid OID in midx");
        let (pack_id, offset) = self.object_entry(i as usize);
        Some((oid, pack_id, offset))
    }

    /// Iterate over all entries in OID order.
    pub fn iter(&self) -> MidxIter<'_> {
        MidxIter { midx: self, pos: 0 }
    }

    /// The pack index for pack `pack_id`, opened on first use and memoized.
    ///
    /// Returns `None` when the pack's index cannot be opened — the
    /// stale-reference contract: a MIDX may legitimately outlive its packs.
    pub fn pack_index(&self, pack_id: u32) -> Option<Arc<PackIndex>> {
        let slot = self.pack_slots.get(pack_id as usize)?;
        slot.get_or_init(|| {
            let path = idx_path_for_pack(&self.pack_dir, &self.pack_names[pack_id as usize]);
            match PackIndex::open(&path) {
                Ok(idx) => Some(Arc::new(idx)),
                Err(err) => {
                    debug!(path = %path.display(), %err, "declining lookups into missing pack");
                    None
                }
            }
        })
        .clone()
    }

    fn fanout_range(&self, first_byte: u8) -> Range<usize> {
        let entry = |i: usize| -> usize {
            let pos = self.fanout.start + i * 4;
            u32::from_be_bytes([
                self.data[pos],
                self.data[pos + 1],
                self.data[pos + 2],
                self.data[pos + 3],
            ]) as usize
        };
        let end = entry(first_byte as usize);
        let start = if first_byte == 0 { 0 } else { entry(first_byte as usize - 1) };
        start..end
    }

    fn oid_bytes_at(&self, index: usize) -> &[u8] {
        let start = self.oid_lookup.start + index * OID_RAW_LEN;
        &self.data[start..start + OID_RAW_LEN]
    }

    fn object_entry(&self, index: usize) -> (u32, u64) {
        let pos = self.object_offsets.start + index * 8;
        let pack_id = u32::from_be_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ]);
        let word = u32::from_be_bytes([
            self.data[pos + 4],
            self.data[pos + 5],
            self.data[pos + 6],
            self.data[pos + 7],
        ]);

        let offset = if word & MIDX_LARGE_OFFSET_NEEDED != 0 {
            let large = self
                .large_offsets
                .as_ref()
                .expect("escape bit set but no large offset chunk");
            let p = large.start + (word & !MIDX_LARGE_OFFSET_NEEDED) as usize * 8;
            assert!(p + 8 <= large.end, "large offset escape index out of range");
            u64::from_be_bytes([
                self.data[p],
                self.data[p + 1],
                self.data[p + 2],
                self.data[p + 3],
                self.data[p + 4],
                self.data[p + 5],
                self.data[p + 6],
                self.data[p + 7],
            ])
        } else {
            word as u64
        };

        (pack_id, offset)
    }
}

/// Iterator over MIDX entries in OID order.
pub struct MidxIter<'a> {
    midx: &'a MultiPackIndex,
    pos: u32,
}

impl Iterator for MidxIter<'_> {
    type Item = (ObjectId, u32, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.midx.nth(self.pos)?;
        self.pos += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.midx.num_objects - self.pos) as usize;
        (remaining, Some(remaining))
    }
}

fn parse_pack_names(
    data: &[u8],
    lookup: &Range<usize>,
    names: &Range<usize>,
    num_packs: usize,
) -> Result<Vec<String>, PackError> {
    let mut result = Vec::with_capacity(num_packs);
    let mut prev_offset: Option<u32> = None;

    for i in 0..num_packs {
        let pos = lookup.start + i * 4;
        let offset =
            u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        if let Some(prev) = prev_offset {
            if offset <= prev {
                return Err(PackError::InvalidMidx(
                    "pack name offsets not strictly increasing".into(),
                ));
            }
        }
        prev_offset = Some(offset);

        let start = names.start + offset as usize;
        if start >= names.end {
            return Err(PackError::InvalidMidx("pack name offset out of range".into()));
        }
        let nul = data[start..names.end]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PackError::InvalidMidx("unterminated pack name".into()))?;
        let name = std::str::from_utf8(&data[start..start + nul])
            .map_err(|_| PackError::InvalidMidx("pack name is not valid UTF-8".into()))?;
        result.push(name.to_string());
    }

    for pair in result.windows(2) {
        if pair[0] >= pair[1] {
            return Err(PackError::InvalidMidx("pack names not sorted".into()));
        }
    }
    Ok(result)
}

/// Open MIDX readers owned by one object store.
///
/// The store must serialize additions; once registered, a reader's lookup
/// path is read-only and safe to share. Dropping the registry drains and
/// destroys the readers.
#[derive(Default)]
pub struct MidxRegistry {
    readers: Vec<MultiPackIndex>,
}

impl MidxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every `midx-*.midx` in a pack directory.
    ///
    /// Unreadable files are skipped; the object store falls back to its other
    /// sources for anything they would have covered.
    pub fn open_dir(pack_dir: impl AsRef<Path>) -> Result<Self, PackError> {
        let mut registry = Self::new();
        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(pack_dir.as_ref())? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("midx-") && name.ends_with(".midx") {
                paths.push(entry.path());
            }
        }
        paths.sort();
        for path in paths {
            match MultiPackIndex::open(&path) {
                Ok(midx) => registry.add(midx),
                Err(err) => debug!(path = %path.display(), %err, "skipping unreadable multi-pack index"),
            }
        }
        Ok(registry)
    }

    /// Register an open reader.
    pub fn add(&mut self, midx: MultiPackIndex) {
        self.readers.push(midx);
    }

    /// The registered readers.
    pub fn readers(&self) -> &[MultiPackIndex] {
        &self.readers
    }

    /// Search every reader in registration order.
    pub fn lookup(&self, oid: &ObjectId) -> Option<(&MultiPackIndex, u32, u64)> {
        for midx in &self.readers {
            if let Some((pack_id, offset)) = midx.lookup(oid) {
                return Some((midx, pack_id, offset));
            }
        }
        None
    }
}
