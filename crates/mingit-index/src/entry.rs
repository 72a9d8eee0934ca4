//! Index entry types: IndexEntry, StatData, EntryFlags.

use bstr::{BStr, BString, ByteSlice};
use mingit_hash::ObjectId;
use mingit_object::FileMode;

use crate::Stage;

/// A single entry in the index.
///
/// Regular entries name one tracked blob. A *sparse-directory* entry stands
/// in for every file under a directory: its path ends in `/`, its mode is a
/// tree, its OID names the tree object, and its skip-worktree bit is set.
/// The discriminator is structural, never a separate tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Path relative to the repository root (the sort key).
    pub path: BString,
    /// Object ID of the blob, or of the tree for a sparse-directory entry.
    pub oid: ObjectId,
    /// File mode.
    pub mode: FileMode,
    /// Merge stage.
    pub stage: Stage,
    /// Cached stat data.
    pub stat: StatData,
    /// Entry flags.
    pub flags: EntryFlags,
}

impl IndexEntry {
    /// Create a stage-0 entry with empty stat data.
    pub fn new(path: impl Into<BString>, oid: ObjectId, mode: FileMode) -> Self {
        Self {
            path: path.into(),
            oid,
            mode,
            stage: Stage::Normal,
            stat: StatData::default(),
            flags: EntryFlags::default(),
        }
    }

    /// Construct a sparse-directory entry for `dir` backed by tree `oid`.
    ///
    /// The stored path always carries the trailing `/` sentinel.
    pub fn sparse_dir(dir: &BStr, oid: ObjectId) -> Self {
        let mut path = BString::from(dir.as_bytes());
        if path.last() != Some(&b'/') {
            path.push(b'/');
        }
        let mut entry = Self::new(path, oid, FileMode::Tree);
        entry.flags.skip_worktree = true;
        entry
    }

    /// Is this a sparse-directory entry (tree mode, trailing `/`)?
    pub fn is_sparse_dir(&self) -> bool {
        self.mode.is_tree() && self.path.last() == Some(&b'/')
    }
}

/// Cached filesystem stat data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatData {
    pub ctime_secs: u32,
    pub ctime_nsecs: u32,
    pub mtime_secs: u32,
    pub mtime_nsecs: u32,
    pub dev: u32,
    pub ino: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
}

/// Per-entry flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryFlags {
    /// Assume the entry is unchanged on disk.
    pub assume_valid: bool,
    /// Placeholder for a not-yet-added file.
    pub intent_to_add: bool,
    /// Tracked but not materialized in the working tree.
    pub skip_worktree: bool,
}

impl EntryFlags {
    /// Extended flags require the v3 on-disk format.
    pub fn has_extended(&self) -> bool {
        self.intent_to_add || self.skip_worktree
    }
}
