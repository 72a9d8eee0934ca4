//! Pack index (v2) reading and writing.
//!
//! A pack index provides the OID → offset mapping for one pack file using a
//! fan-out table and binary search. Format:
//!
//! ```text
//! Header:  \xff tOc (4 bytes) | version (4 bytes = 2)
//! Fanout:  256 × 4-byte big-endian cumulative counts
//! OIDs:    N × 20-byte sorted OIDs
//! CRC32:   N × 4-byte CRC32 values
//! Offsets: N × 4-byte offsets (high bit set → index into 64-bit table)
//! 64-bit:  M × 8-byte offsets (for packs > 2 GiB)
//! Trailer: 20-byte pack checksum | 20-byte index checksum
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use mingit_hash::fanout::{FanoutTable, FANOUT_SIZE};
use mingit_hash::hasher::Hasher;
use mingit_hash::{ObjectId, OID_RAW_LEN};

use crate::{PackError, IDX_SIGNATURE, IDX_VERSION};

const IDX_HEADER_SIZE: usize = 8;

/// Memory-mapped pack index (v2).
pub struct PackIndex {
    data: Mmap,
    num_objects: u32,
    oid_offset: usize,
    crc_offset: usize,
    offset32_offset: usize,
    offset64_offset: usize,
    idx_path: PathBuf,
}

impl PackIndex {
    /// Open and validate a pack index file.
    pub fn open(idx_path: impl AsRef<Path>) -> Result<Self, PackError> {
        let idx_path = idx_path.as_ref().to_path_buf();
        let file = std::fs::File::open(&idx_path)?;
        let data = unsafe { Mmap::map(&file)? };

        if data.len() < IDX_HEADER_SIZE + FANOUT_SIZE + 2 * OID_RAW_LEN {
            return Err(PackError::InvalidIndex(format!(
                "{}: file too small",
                idx_path.display()
            )));
        }
        if data[0..4] != IDX_SIGNATURE {
            return Err(PackError::InvalidIndex(format!(
                "{}: bad signature",
                idx_path.display()
            )));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != IDX_VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }

        let last_fanout = IDX_HEADER_SIZE + 255 * 4;
        let num_objects = u32::from_be_bytes([
            data[last_fanout],
            data[last_fanout + 1],
            data[last_fanout + 2],
            data[last_fanout + 3],
        ]);

        let n = num_objects as usize;
        let oid_offset = IDX_HEADER_SIZE + FANOUT_SIZE;
        let crc_offset = oid_offset + n * OID_RAW_LEN;
        let offset32_offset = crc_offset + n * 4;
        let offset64_offset = offset32_offset + n * 4;

        // The 64-bit table is variable; everything before it plus the two
        // trailing hashes must fit.
        if data.len() < offset64_offset + 2 * OID_RAW_LEN {
            return Err(PackError::InvalidIndex(format!(
                "{}: file too small for {n} objects",
                idx_path.display()
            )));
        }

        Ok(Self {
            data,
            num_objects,
            oid_offset,
            crc_offset,
            offset32_offset,
            offset64_offset,
            idx_path,
        })
    }

    /// Number of objects in the pack.
    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    /// Path to the `.idx` file.
    pub fn path(&self) -> &Path {
        &self.idx_path
    }

    /// Look up an OID, returning the offset within the pack.
    pub fn lookup(&self, oid: &ObjectId) -> Option<u64> {
        let range = self.fanout_range(oid.first_byte());
        let target = oid.as_bytes();

        let mut low = range.start;
        let mut high = range.end;
        while low < high {
            let mid = low + (high - low) / 2;
            match self.oid_bytes_at(mid).cmp(target) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Some(self.offset_at_index(mid as u32)),
            }
        }
        None
    }

    /// Raw OID bytes at the given sorted index position.
    fn oid_bytes_at(&self, index: usize) -> &[u8] {
        let start = self.oid_offset + index * OID_RAW_LEN;
        &self.data[start..start + OID_RAW_LEN]
    }

    /// OID at the given sorted index position.
    pub fn oid_at_index(&self, index: u32) -> ObjectId {
        let start = self.oid_offset + index as usize * OID_RAW_LEN;
        ObjectId::from_bytes(&self.data[start..start + OID_RAW_LEN]).expect("valid OID in index")
    }

    /// Pack offset at the given sorted index position.
    pub fn offset_at_index(&self, index: u32) -> u64 {
        let pos = self.offset32_offset + index as usize * 4;
        let val =
            u32::from_be_bytes([self.data[pos], self.data[pos + 1], self.data[pos + 2], self.data[pos + 3]]);

        if val & 0x8000_0000 != 0 {
            let idx64 = (val & 0x7fff_ffff) as usize;
            let pos64 = self.offset64_offset + idx64 * 8;
            u64::from_be_bytes([
                self.data[pos64],
                self.data[pos64 + 1],
                self.data[pos64 + 2],
                self.data[pos64 + 3],
                self.data[pos64 + 4],
                self.data[pos64 + 5],
                self.data[pos64 + 6],
                self.data[pos64 + 7],
            ])
        } else {
            val as u64
        }
    }

    /// CRC32 at the given sorted index position.
    pub fn crc32_at_index(&self, index: u32) -> u32 {
        let pos = self.crc_offset + index as usize * 4;
        u32::from_be_bytes([self.data[pos], self.data[pos + 1], self.data[pos + 2], self.data[pos + 3]])
    }

    fn fanout_range(&self, first_byte: u8) -> std::ops::Range<usize> {
        let entry = |i: usize| -> usize {
            let pos = IDX_HEADER_SIZE + i * 4;
            u32::from_be_bytes([self.data[pos], self.data[pos + 1], self.data[pos + 2], self.data[pos + 3]])
                as usize
        };
        let end = entry(first_byte as usize);
        let start = if first_byte == 0 { 0 } else { entry(first_byte as usize - 1) };
        start..end
    }
}

/// One object recorded in a pack index.
#[derive(Debug, Clone, Copy)]
pub struct PackIndexEntry {
    pub oid: ObjectId,
    pub offset: u64,
    pub crc32: u32,
}

/// Write a v2 pack index for the given entries.
///
/// Entries are sorted internally; `pack_checksum` is the trailing hash of the
/// pack the index describes. Returns the index checksum.
pub fn write_index(
    path: impl AsRef<Path>,
    entries: &[PackIndexEntry],
    pack_checksum: &ObjectId,
) -> Result<ObjectId, PackError> {
    let mut sorted: Vec<PackIndexEntry> = entries.to_vec();
    sorted.sort_by(|a, b| a.oid.cmp(&b.oid));

    let mut buf = Vec::new();
    buf.extend_from_slice(&IDX_SIGNATURE);
    buf.extend_from_slice(&IDX_VERSION.to_be_bytes());

    let oids: Vec<ObjectId> = sorted.iter().map(|e| e.oid).collect();
    buf.extend_from_slice(&FanoutTable::build(&oids).to_bytes());

    for entry in &sorted {
        buf.extend_from_slice(entry.oid.as_bytes());
    }
    for entry in &sorted {
        buf.extend_from_slice(&entry.crc32.to_be_bytes());
    }

    let mut large_offsets: Vec<u64> = Vec::new();
    for entry in &sorted {
        if entry.offset >= 1 << 31 {
            let word = 0x8000_0000u32 | large_offsets.len() as u32;
            buf.extend_from_slice(&word.to_be_bytes());
            large_offsets.push(entry.offset);
        } else {
            buf.extend_from_slice(&(entry.offset as u32).to_be_bytes());
        }
    }
    for offset in &large_offsets {
        buf.extend_from_slice(&offset.to_be_bytes());
    }

    buf.extend_from_slice(pack_checksum.as_bytes());

    let index_checksum = Hasher::digest(&buf)?;
    buf.extend_from_slice(index_checksum.as_bytes());

    let mut file = std::fs::File::create(path.as_ref())?;
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(index_checksum)
}
