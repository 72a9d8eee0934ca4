//! Index file writing and cache-tree production.

use std::io::Write;
use std::ops::Range;
use std::path::Path;

use bstr::{BString, ByteSlice};
use mingit_hash::hasher::Hasher;
use mingit_object::store::TreeSink;
use mingit_object::{FileMode, Tree, TreeEntry};

use crate::entry::IndexEntry;
use crate::read::{ondisk_entry_size, INDEX_SIGNATURE};
use crate::tree::{CacheTree, CacheTreeNode};
use crate::{Index, IndexError, Stage};

/// Marker extension flagging a sparse index on disk.
///
/// The lowercase first byte makes it mandatory: readers that predate the
/// sparse representation refuse the file instead of misreading directory
/// entries as blobs.
pub(crate) const SPARSE_MARKER_SIGNATURE: &[u8; 4] = b"sdir";

/// Write the index to `path` atomically under the lock-file protocol.
pub(crate) fn write_index(index: &Index, path: &Path) -> Result<(), IndexError> {
    let mut lock = mingit_util::LockFile::acquire(path).map_err(|_| IndexError::LockFailed {
        path: path.to_path_buf(),
    })?;

    let data = serialize_index(index)?;
    lock.write_all(&data)?;
    lock.commit().map_err(|_| IndexError::LockFailed {
        path: path.to_path_buf(),
    })?;
    Ok(())
}

fn serialize_index(index: &Index) -> Result<Vec<u8>, IndexError> {
    // Extended flags (skip-worktree, intent-to-add) require v3.
    let needs_v3 = index.iter().any(|e| e.flags.has_extended());
    let version = if needs_v3 { index.version().max(3) } else { index.version().clamp(2, 3) };

    let mut buf = Vec::new();
    buf.extend_from_slice(INDEX_SIGNATURE);
    buf.extend_from_slice(&version.to_be_bytes());
    buf.extend_from_slice(&(index.len() as u32).to_be_bytes());

    for entry in index.iter() {
        write_entry(&mut buf, entry);
    }

    if let Some(tree) = index.cache_tree() {
        let payload = tree.serialize();
        buf.extend_from_slice(CacheTree::SIGNATURE);
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
    }

    // The sparse marker goes out iff sparse-directory entries exist, keeping
    // the flag and the entry array consistent on disk.
    if index.iter().any(IndexEntry::is_sparse_dir) {
        buf.extend_from_slice(SPARSE_MARKER_SIGNATURE);
        buf.extend_from_slice(&0u32.to_be_bytes());
    }

    if let Some(state) = index.fsmonitor() {
        buf.extend_from_slice(b"FSMN");
        buf.extend_from_slice(&(state.len() as u32).to_be_bytes());
        buf.extend_from_slice(state);
    }

    for ext in index.unknown_extensions() {
        buf.extend_from_slice(&ext.signature);
        buf.extend_from_slice(&(ext.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&ext.data);
    }

    let checksum = Hasher::digest(&buf)
        .map_err(|_| IndexError::InvalidHeader("checksum computation failed".into()))?;
    buf.extend_from_slice(checksum.as_bytes());
    Ok(buf)
}

fn write_entry(buf: &mut Vec<u8>, entry: &IndexEntry) {
    let start = buf.len();

    buf.extend_from_slice(&entry.stat.ctime_secs.to_be_bytes());
    buf.extend_from_slice(&entry.stat.ctime_nsecs.to_be_bytes());
    buf.extend_from_slice(&entry.stat.mtime_secs.to_be_bytes());
    buf.extend_from_slice(&entry.stat.mtime_nsecs.to_be_bytes());
    buf.extend_from_slice(&entry.stat.dev.to_be_bytes());
    buf.extend_from_slice(&entry.stat.ino.to_be_bytes());
    buf.extend_from_slice(&entry.mode.raw().to_be_bytes());
    buf.extend_from_slice(&entry.stat.uid.to_be_bytes());
    buf.extend_from_slice(&entry.stat.gid.to_be_bytes());
    buf.extend_from_slice(&entry.stat.size.to_be_bytes());

    buf.extend_from_slice(entry.oid.as_bytes());

    let extended = entry.flags.has_extended();
    let mut flags: u16 = entry.path.len().min(0xfff) as u16;
    flags |= (entry.stage.as_u8() as u16) << 12;
    if entry.flags.assume_valid {
        flags |= 0x8000;
    }
    if extended {
        flags |= 0x4000;
    }
    buf.extend_from_slice(&flags.to_be_bytes());

    if extended {
        let mut ext_flags: u16 = 0;
        if entry.flags.intent_to_add {
            ext_flags |= 0x2000;
        }
        if entry.flags.skip_worktree {
            ext_flags |= 0x4000;
        }
        buf.extend_from_slice(&ext_flags.to_be_bytes());
    }

    buf.extend_from_slice(&entry.path);

    let entry_size = ondisk_entry_size(entry.path.len(), extended);
    let padding = entry_size - (buf.len() - start);
    buf.resize(buf.len() + padding, 0);
}

/// Rebuild a fully valid cache tree from the index, writing the tree objects
/// it summarizes through `sink`.
///
/// Fails on unmerged entries: a conflicted span has no single tree. Existing
/// sparse-directory entries contribute their recorded tree OID directly.
pub fn cache_tree_update(index: &Index, sink: &mut dyn TreeSink) -> Result<CacheTree, IndexError> {
    let entries = index.entries();
    let root = build_subtree(entries, 0..entries.len(), b"", b"", sink)?;
    Ok(CacheTree { root })
}

fn build_subtree(
    entries: &[IndexEntry],
    range: Range<usize>,
    prefix: &[u8],
    name: &[u8],
    sink: &mut dyn TreeSink,
) -> Result<CacheTreeNode, IndexError> {
    let mut tree_entries: Vec<TreeEntry> = Vec::new();
    let mut children: Vec<CacheTreeNode> = Vec::new();

    let span = range.clone();
    let mut i = range.start;
    while i < range.end {
        let entry = &entries[i];
        if entry.stage != Stage::Normal {
            return Err(IndexError::UnmergedEntry(entry.path.clone()));
        }
        let rest = &entry.path[prefix.len()..];

        if entry.is_sparse_dir() {
            // `rest` ends in '/'; the recorded OID already summarizes the
            // whole subtree.
            let dir = &rest[..rest.len() - 1];
            tree_entries.push(TreeEntry {
                mode: FileMode::Tree,
                name: dir.into(),
                oid: entry.oid,
            });
            children.push(CacheTreeNode {
                name: dir.into(),
                entry_count: 1,
                oid: Some(entry.oid),
                children: Vec::new(),
            });
            i += 1;
        } else if let Some(slash) = rest.find_byte(b'/') {
            let dir = &rest[..slash];
            let mut sub_prefix = BString::from(prefix);
            sub_prefix.extend_from_slice(dir);
            sub_prefix.push(b'/');

            let mut j = i + 1;
            while j < range.end && entries[j].path.starts_with(&sub_prefix) {
                j += 1;
            }

            let child = build_subtree(entries, i..j, &sub_prefix, dir, sink)?;
            tree_entries.push(TreeEntry {
                mode: FileMode::Tree,
                name: dir.into(),
                oid: child.oid.expect("freshly built subtree is valid"),
            });
            children.push(child);
            i = j;
        } else {
            tree_entries.push(TreeEntry {
                mode: entry.mode,
                name: rest.into(),
                oid: entry.oid,
            });
            i += 1;
        }
    }

    let oid = sink.write_tree(&Tree { entries: tree_entries })?;
    children.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(CacheTreeNode {
        name: name.into(),
        entry_count: span.len() as i32,
        oid: Some(oid),
        children,
    })
}
