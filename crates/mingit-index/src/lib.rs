//! The index (staging area), including the sparse-index representation.
//!
//! An index is *full* when it carries one entry per tracked blob, and
//! *sparse* when directory-level placeholder entries stand in for entire
//! unselected subtrees. The [`sparse_index`] module holds the contraction
//! and expansion between the two shapes.

pub mod entry;
mod read;
pub mod sparse;
pub mod sparse_index;
pub mod tree;
mod write;

use std::path::Path;

use bstr::{BStr, BString, ByteSlice};

pub use entry::{EntryFlags, IndexEntry, StatData};
pub use sparse::{PatternMatch, SparseCheckout};
pub use sparse_index::{ConvertResult, SparseSettings};
pub use tree::{CacheTree, CacheTreeNode};
pub use write::cache_tree_update;

/// Errors produced by index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("invalid index header: {0}")]
    InvalidHeader(String),

    #[error("unsupported index version: {0}")]
    UnsupportedVersion(u32),

    #[error("index checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid index entry at offset {offset}: {reason}")]
    InvalidEntry { offset: usize, reason: String },

    #[error("invalid extension '{sig}': {reason}")]
    InvalidExtension { sig: String, reason: String },

    #[error("unsupported mandatory extension '{0}'")]
    UnsupportedExtension(String),

    #[error("sparse index requires cone-mode sparse-checkout patterns")]
    NonConePatterns,

    #[error("cannot summarize unmerged index entry '{0}'")]
    UnmergedEntry(BString),

    #[error("lock failed: {path}")]
    LockFailed { path: std::path::PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Object(#[from] mingit_object::ObjectError),
}

/// Merge stage of an index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Stage {
    /// Normal entry (stage 0).
    #[default]
    Normal,
    /// Common ancestor in a merge conflict (stage 1).
    Base,
    /// Our side of a merge conflict (stage 2).
    Ours,
    /// Their side of a merge conflict (stage 3).
    Theirs,
}

impl Stage {
    pub fn as_u8(&self) -> u8 {
        match self {
            Stage::Normal => 0,
            Stage::Base => 1,
            Stage::Ours => 2,
            Stage::Theirs => 3,
        }
    }

    pub fn from_u8(n: u8) -> Result<Self, IndexError> {
        match n {
            0 => Ok(Stage::Normal),
            1 => Ok(Stage::Base),
            2 => Ok(Stage::Ours),
            3 => Ok(Stage::Theirs),
            _ => Err(IndexError::InvalidEntry {
                offset: 0,
                reason: format!("invalid stage: {n}"),
            }),
        }
    }
}

/// The in-memory index.
#[derive(Debug)]
pub struct Index {
    /// On-disk format version (2, 3, or 4).
    version: u32,
    /// Entries sorted by (path, stage).
    entries: Vec<IndexEntry>,
    /// Cache tree extension, when present and current.
    cache_tree: Option<CacheTree>,
    /// Whether sparse-directory entries may be present.
    sparse: bool,
    /// Set when this index is backed by a split (shared) index.
    split_index: bool,
    /// Opaque filesystem-monitor extension payload.
    fsmonitor: Option<Vec<u8>>,
    /// Optional extensions preserved for round-trip.
    unknown_extensions: Vec<RawExtension>,
    /// Reentrancy guard for targeted expansion.
    pub(crate) expanding: bool,
}

/// Raw optional extension (preserved for round-trip).
#[derive(Debug, Clone)]
pub struct RawExtension {
    pub signature: [u8; 4],
    pub data: Vec<u8>,
}

impl Index {
    /// Create a new empty index.
    pub fn new() -> Self {
        Self {
            version: 2,
            entries: Vec::new(),
            cache_tree: None,
            sparse: false,
            split_index: false,
            fsmonitor: None,
            unknown_extensions: Vec::new(),
            expanding: false,
        }
    }

    /// Build an index from entries, sorting them into canonical order.
    pub fn from_entries(mut entries: Vec<IndexEntry>) -> Self {
        entries.sort_by(cmp_entries);
        let sparse = entries.iter().any(IndexEntry::is_sparse_dir);
        Self {
            entries,
            sparse,
            ..Self::new()
        }
    }

    /// Read the index from a file.
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let file = std::fs::File::open(path.as_ref())?;
        let data = unsafe { memmap2::Mmap::map(&file) }?;
        read::parse_index(&data)
    }

    /// Write the index to a file atomically under the lock-file protocol.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), IndexError> {
        write::write_index(self, path.as_ref())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in canonical order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    /// Get an entry by path and stage.
    pub fn get(&self, path: &BStr, stage: Stage) -> Option<&IndexEntry> {
        self.entries
            .binary_search_by(|e| {
                e.path
                    .as_slice()
                    .cmp(path.as_ref())
                    .then(e.stage.as_u8().cmp(&stage.as_u8()))
            })
            .ok()
            .map(|pos| &self.entries[pos])
    }

    /// Does any entry carry this exact path (any stage)?
    pub fn contains_path(&self, path: &BStr) -> bool {
        self.entries
            .binary_search_by(|e| e.path.as_slice().cmp(path.as_ref()))
            .is_ok()
    }

    /// Add or replace an entry, keeping canonical order and invalidating the
    /// cache tree along its path.
    pub fn add(&mut self, entry: IndexEntry) {
        if let Some(ref mut tree) = self.cache_tree {
            tree.invalidate(BStr::new(&entry.path));
        }
        match self.entries.binary_search_by(|e| cmp_entries(e, &entry)) {
            Ok(pos) => self.entries[pos] = entry,
            Err(pos) => self.entries.insert(pos, entry),
        }
        self.sparse = self.sparse || self.entries.iter().any(IndexEntry::is_sparse_dir);
    }

    /// Remove entries for `path` at `stage`. Returns whether any were removed.
    pub fn remove(&mut self, path: &BStr, stage: Stage) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.path.as_slice() == path.as_bytes() && e.stage == stage));
        let removed = self.entries.len() < before;
        if removed {
            if let Some(ref mut tree) = self.cache_tree {
                tree.invalidate(path);
            }
        }
        removed
    }

    /// Does the index contain any merge-conflict stages?
    pub fn has_conflicts(&self) -> bool {
        self.entries.iter().any(|e| e.stage != Stage::Normal)
    }

    /// Is the index in the sparse representation?
    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    /// Is this index backed by a split index?
    pub fn split_index(&self) -> bool {
        self.split_index
    }

    /// Mark the index as split-backed; the sparse contractor then declines.
    pub fn set_split_index(&mut self, split: bool) {
        self.split_index = split;
    }

    /// On-disk format version.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn cache_tree(&self) -> Option<&CacheTree> {
        self.cache_tree.as_ref()
    }

    pub fn set_cache_tree(&mut self, tree: Option<CacheTree>) {
        self.cache_tree = tree;
    }

    /// Opaque filesystem-monitor state, if any.
    pub fn fsmonitor(&self) -> Option<&[u8]> {
        self.fsmonitor.as_deref()
    }

    pub fn set_fsmonitor(&mut self, state: Option<Vec<u8>>) {
        self.fsmonitor = state;
    }

    pub(crate) fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    pub(crate) fn set_sparse(&mut self, sparse: bool) {
        self.sparse = sparse;
    }

    pub(crate) fn replace_entries(&mut self, entries: Vec<IndexEntry>) {
        // The new array goes in place first; the old entries drop after.
        self.entries = entries;
    }

    pub(crate) fn set_raw_extensions(
        &mut self,
        cache_tree: Option<CacheTree>,
        fsmonitor: Option<Vec<u8>>,
        unknown: Vec<RawExtension>,
    ) {
        self.cache_tree = cache_tree;
        self.fsmonitor = fsmonitor;
        self.unknown_extensions = unknown;
    }

    pub(crate) fn unknown_extensions(&self) -> &[RawExtension] {
        &self.unknown_extensions
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical entry order: by path bytes, then stage.
pub(crate) fn cmp_entries(a: &IndexEntry, b: &IndexEntry) -> std::cmp::Ordering {
    a.path
        .cmp(&b.path)
        .then(a.stage.as_u8().cmp(&b.stage.as_u8()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mingit_hash::ObjectId;
    use mingit_object::FileMode;

    fn oid(n: u8) -> ObjectId {
        let mut raw = [0u8; 20];
        raw[19] = n;
        ObjectId::from_raw(raw)
    }

    #[test]
    fn from_entries_sorts_and_detects_sparse() {
        let index = Index::from_entries(vec![
            IndexEntry::new("b", oid(2), FileMode::Regular),
            IndexEntry::new("a", oid(1), FileMode::Regular),
        ]);
        assert_eq!(index.entries()[0].path, "a");
        assert!(!index.is_sparse());

        let sparse = Index::from_entries(vec![
            IndexEntry::new("a", oid(1), FileMode::Regular),
            IndexEntry::sparse_dir(BStr::new(b"d"), oid(2)),
        ]);
        assert!(sparse.is_sparse());
    }

    #[test]
    fn get_and_contains_use_binary_search() {
        let index = Index::from_entries(vec![
            IndexEntry::new("a", oid(1), FileMode::Regular),
            IndexEntry::new("b/c", oid(2), FileMode::Regular),
        ]);
        assert!(index.get(BStr::new(b"b/c"), Stage::Normal).is_some());
        assert!(index.get(BStr::new(b"b/c"), Stage::Ours).is_none());
        assert!(index.contains_path(BStr::new(b"a")));
        assert!(!index.contains_path(BStr::new(b"zz")));
    }

    #[test]
    fn add_keeps_order_and_replaces() {
        let mut index = Index::new();
        index.add(IndexEntry::new("m", oid(1), FileMode::Regular));
        index.add(IndexEntry::new("a", oid(2), FileMode::Regular));
        index.add(IndexEntry::new("z", oid(3), FileMode::Regular));
        let paths: Vec<&BStr> = index.iter().map(|e| BStr::new(&e.path)).collect();
        assert_eq!(paths, vec![BStr::new(b"a"), BStr::new(b"m"), BStr::new(b"z")]);

        index.add(IndexEntry::new("m", oid(9), FileMode::Executable));
        assert_eq!(index.len(), 3);
        assert_eq!(index.get(BStr::new(b"m"), Stage::Normal).unwrap().oid, oid(9));
    }

    #[test]
    fn remove_reports_outcome() {
        let mut index = Index::from_entries(vec![IndexEntry::new("a", oid(1), FileMode::Regular)]);
        assert!(index.remove(BStr::new(b"a"), Stage::Normal));
        assert!(!index.remove(BStr::new(b"a"), Stage::Normal));
        assert!(index.is_empty());
    }
}
