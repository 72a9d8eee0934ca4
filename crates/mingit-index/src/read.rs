//! Index file reading (v2/v3/v4).

use bstr::BString;
use mingit_hash::hasher::Hasher;
use mingit_hash::{ObjectId, OID_RAW_LEN};
use mingit_object::FileMode;
use tracing::warn;

use crate::entry::{EntryFlags, IndexEntry, StatData};
use crate::tree::CacheTree;
use crate::write::SPARSE_MARKER_SIGNATURE;
use crate::{Index, IndexError, RawExtension, Stage};

/// Magic bytes at the start of every index file.
pub(crate) const INDEX_SIGNATURE: &[u8; 4] = b"DIRC";

/// Parse an index file from raw bytes.
pub(crate) fn parse_index(data: &[u8]) -> Result<Index, IndexError> {
    if data.len() < 12 + OID_RAW_LEN {
        return Err(IndexError::InvalidHeader("index file too short".into()));
    }
    verify_checksum(data)?;

    let mut cursor = 0;
    if &data[..4] != INDEX_SIGNATURE {
        return Err(IndexError::InvalidHeader(format!(
            "bad signature: {:?}",
            &data[..4]
        )));
    }
    cursor += 4;

    let version = read_u32(&data[cursor..]);
    cursor += 4;
    if !(2..=4).contains(&version) {
        return Err(IndexError::UnsupportedVersion(version));
    }

    let entry_count = read_u32(&data[cursor..]) as usize;
    cursor += 4;

    let content_end = data.len() - OID_RAW_LEN;
    let mut entries = Vec::with_capacity(entry_count);
    let mut prev_path = BString::default();

    for _ in 0..entry_count {
        let (entry, new_cursor) = parse_entry(data, cursor, version, &prev_path, content_end)?;
        prev_path = entry.path.clone();
        entries.push(entry);
        cursor = new_cursor;
    }

    let mut cache_tree = None;
    let mut fsmonitor = None;
    let mut sparse_marker = false;
    let mut unknown_extensions = Vec::new();

    while cursor + 8 <= content_end {
        let sig = &data[cursor..cursor + 4];
        let ext_size = read_u32(&data[cursor + 4..]) as usize;
        cursor += 8;

        if cursor + ext_size > content_end {
            return Err(IndexError::InvalidExtension {
                sig: String::from_utf8_lossy(sig).into(),
                reason: "extension data exceeds index bounds".into(),
            });
        }
        let ext_data = &data[cursor..cursor + ext_size];
        cursor += ext_size;

        match sig {
            s if s == CacheTree::SIGNATURE => cache_tree = Some(CacheTree::parse(ext_data)?),
            s if s == SPARSE_MARKER_SIGNATURE => sparse_marker = true,
            b"FSMN" => fsmonitor = Some(ext_data.to_vec()),
            _ => {
                // An extension whose first byte is outside 'A'..'Z' is
                // mandatory: readers that do not understand it must refuse
                // the file rather than misread it.
                if !sig[0].is_ascii_uppercase() {
                    return Err(IndexError::UnsupportedExtension(
                        String::from_utf8_lossy(sig).into(),
                    ));
                }
                let mut signature = [0u8; 4];
                signature.copy_from_slice(sig);
                unknown_extensions.push(RawExtension {
                    signature,
                    data: ext_data.to_vec(),
                });
            }
        }
    }

    let has_sparse_entries = entries.iter().any(IndexEntry::is_sparse_dir);
    if sparse_marker != has_sparse_entries {
        warn!(
            marker = sparse_marker,
            entries = has_sparse_entries,
            "sparse marker disagrees with entry array; trusting the entries"
        );
    }

    let mut index = Index::from_entries(entries);
    index.set_version(version);
    index.set_sparse(has_sparse_entries);
    index.set_raw_extensions(cache_tree, fsmonitor, unknown_extensions);
    Ok(index)
}

/// Fixed-width stat portion of an on-disk entry:
/// ctime(8) + mtime(8) + dev(4) + ino(4) + mode(4) + uid(4) + gid(4) + size(4).
const ONDISK_STAT_SIZE: usize = 40;

/// On-disk entry size for v2/v3, padded to a multiple of 8.
pub(crate) fn ondisk_entry_size(name_len: usize, has_extended: bool) -> usize {
    let flags_size = if has_extended { 4 } else { 2 };
    (ONDISK_STAT_SIZE + OID_RAW_LEN + flags_size + name_len + 8) & !7
}

fn parse_entry(
    data: &[u8],
    start: usize,
    version: u32,
    prev_path: &BString,
    content_end: usize,
) -> Result<(IndexEntry, usize), IndexError> {
    let mut cursor = start;
    if cursor + ONDISK_STAT_SIZE + OID_RAW_LEN + 2 > content_end {
        return Err(IndexError::InvalidEntry {
            offset: start,
            reason: "entry too short".into(),
        });
    }

    let stat = StatData {
        ctime_secs: read_u32(&data[cursor..]),
        ctime_nsecs: read_u32(&data[cursor + 4..]),
        mtime_secs: read_u32(&data[cursor + 8..]),
        mtime_nsecs: read_u32(&data[cursor + 12..]),
        dev: read_u32(&data[cursor + 16..]),
        ino: read_u32(&data[cursor + 20..]),
        uid: read_u32(&data[cursor + 28..]),
        gid: read_u32(&data[cursor + 32..]),
        size: read_u32(&data[cursor + 36..]),
    };
    let mode_raw = read_u32(&data[cursor + 24..]);
    cursor += ONDISK_STAT_SIZE;

    let oid = ObjectId::from_bytes(&data[cursor..cursor + OID_RAW_LEN]).map_err(|_| {
        IndexError::InvalidEntry {
            offset: start,
            reason: "invalid OID".into(),
        }
    })?;
    cursor += OID_RAW_LEN;

    let flags_raw = read_u16(&data[cursor..]);
    cursor += 2;

    let assume_valid = flags_raw & 0x8000 != 0;
    let extended = flags_raw & 0x4000 != 0;
    let stage = Stage::from_u8(((flags_raw >> 12) & 0x03) as u8)?;

    let mut flags = EntryFlags {
        assume_valid,
        ..EntryFlags::default()
    };
    if extended {
        if version < 3 {
            return Err(IndexError::InvalidEntry {
                offset: start,
                reason: "extended flags in a v2 index".into(),
            });
        }
        if cursor + 2 > content_end {
            return Err(IndexError::InvalidEntry {
                offset: start,
                reason: "truncated extended flags".into(),
            });
        }
        let ext_flags = read_u16(&data[cursor..]);
        cursor += 2;
        flags.intent_to_add = ext_flags & 0x2000 != 0;
        flags.skip_worktree = ext_flags & 0x4000 != 0;
    }

    let path = if version == 4 {
        parse_v4_path(data, &mut cursor, prev_path, content_end)?
    } else {
        let nul = data[cursor..content_end]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| IndexError::InvalidEntry {
                offset: start,
                reason: "missing NUL in path".into(),
            })?;
        let path = BString::from(&data[cursor..cursor + nul]);
        cursor = start + ondisk_entry_size(nul, extended);
        if cursor > content_end {
            return Err(IndexError::InvalidEntry {
                offset: start,
                reason: "entry padding past end of file".into(),
            });
        }
        path
    };

    let mode = FileMode::from_raw(mode_raw).map_err(|e| IndexError::InvalidEntry {
        offset: start,
        reason: e.to_string(),
    })?;

    Ok((
        IndexEntry {
            path,
            oid,
            mode,
            stage,
            stat,
            flags,
        },
        cursor,
    ))
}

/// Parse a v4 path with prefix compression.
fn parse_v4_path(
    data: &[u8],
    cursor: &mut usize,
    prev_path: &BString,
    content_end: usize,
) -> Result<BString, IndexError> {
    let (strip_len, consumed) = read_varint(&data[*cursor..content_end]);
    *cursor += consumed;

    let suffix_start = *cursor;
    let nul = data[suffix_start..content_end]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| IndexError::InvalidEntry {
            offset: suffix_start,
            reason: "missing NUL in v4 path suffix".into(),
        })?;
    let suffix = &data[suffix_start..suffix_start + nul];
    *cursor = suffix_start + nul + 1; // no padding in v4

    let keep = prev_path.len().saturating_sub(strip_len);
    let mut path = BString::from(&prev_path[..keep]);
    path.extend_from_slice(suffix);
    Ok(path)
}

fn read_varint(data: &[u8]) -> (usize, usize) {
    let mut value = 0usize;
    let mut shift = 0;
    let mut consumed = 0;
    for &byte in data {
        consumed += 1;
        value |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    (value, consumed)
}

fn verify_checksum(data: &[u8]) -> Result<(), IndexError> {
    let content = &data[..data.len() - OID_RAW_LEN];
    let stored = &data[data.len() - OID_RAW_LEN..];
    let computed = Hasher::digest(content).map_err(|_| IndexError::ChecksumMismatch)?;
    if computed.as_bytes() != stored {
        return Err(IndexError::ChecksumMismatch);
    }
    Ok(())
}

fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

fn read_u16(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}
