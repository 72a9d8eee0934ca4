//! Pack index (`.idx`) and multi-pack index (MIDX) support.
//!
//! A pack index maps OIDs to offsets within one pack; the MIDX aggregates
//! those mappings across many packs into a single chunked file for
//! O(log n) cross-pack lookup.

pub mod chunk;
pub mod index;
pub mod midx;

use mingit_hash::{HashError, ObjectId};

/// Errors that can occur during pack and MIDX operations.
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("invalid pack index: {0}")]
    InvalidIndex(String),

    #[error("invalid multi-pack index: {0}")]
    InvalidMidx(String),

    #[error("multi-pack index missing required chunk {0}")]
    MissingChunk(&'static str),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: ObjectId, actual: ObjectId },

    #[error("unsupported version: {0:#x}")]
    UnsupportedVersion(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Hash(#[from] HashError),
}

/// MIDX signature bytes.
pub const MIDX_SIGNATURE: &[u8; 4] = b"MIDX";
/// The single supported MIDX version.
pub const MIDX_VERSION: u32 = 0x8000_0001;
/// Hash version byte: 1 denotes the 20-byte identifier.
pub const MIDX_HASH_VERSION: u8 = 1;
/// Size of the fixed MIDX header.
pub const MIDX_HEADER_SIZE: usize = 16;
/// Size of one chunk lookup table record (4-byte id, 8-byte offset).
pub const CHUNK_LOOKUP_ENTRY_SIZE: usize = 12;
/// High bit of an object-offset word: low 31 bits index the large-offset chunk.
pub const MIDX_LARGE_OFFSET_NEEDED: u32 = 0x8000_0000;

/// Chunk IDs used in MIDX files (big-endian ASCII).
pub const CHUNK_PACK_LOOKUP: u32 = u32::from_be_bytes(*b"PLOO");
pub const CHUNK_PACK_NAMES: u32 = u32::from_be_bytes(*b"PNAM");
pub const CHUNK_OID_FANOUT: u32 = u32::from_be_bytes(*b"OIDF");
pub const CHUNK_OID_LOOKUP: u32 = u32::from_be_bytes(*b"OIDL");
pub const CHUNK_OBJECT_OFFSETS: u32 = u32::from_be_bytes(*b"OOFF");
pub const CHUNK_LARGE_OFFSETS: u32 = u32::from_be_bytes(*b"LOFF");

/// Pack index v2 constants.
pub const IDX_SIGNATURE: [u8; 4] = [0xff, 0x74, 0x4f, 0x63]; // "\377tOc"
pub const IDX_VERSION: u32 = 2;
