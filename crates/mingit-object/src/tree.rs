use std::cmp::Ordering;

use bstr::{BStr, BString, ByteSlice};
use mingit_hash::{ObjectId, OID_RAW_LEN};

use crate::ObjectError;

/// File mode for tree entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileMode {
    /// Regular file (100644)
    Regular,
    /// Executable file (100755)
    Executable,
    /// Symbolic link (120000)
    Symlink,
    /// Submodule link (160000)
    Gitlink,
    /// Subdirectory (040000)
    Tree,
}

impl FileMode {
    /// Create from the raw numeric value.
    pub fn from_raw(raw: u32) -> Result<Self, ObjectError> {
        match raw {
            0o100644 => Ok(Self::Regular),
            0o100755 => Ok(Self::Executable),
            0o120000 => Ok(Self::Symlink),
            0o160000 => Ok(Self::Gitlink),
            0o040000 => Ok(Self::Tree),
            other => Err(ObjectError::InvalidFileMode(format!("{other:o}"))),
        }
    }

    /// Parse from octal ASCII bytes (e.g. `b"100644"`).
    pub fn from_bytes(s: &[u8]) -> Result<Self, ObjectError> {
        let raw = parse_octal(s)
            .ok_or_else(|| ObjectError::InvalidFileMode(String::from_utf8_lossy(s).into()))?;
        Self::from_raw(raw)
    }

    /// The raw numeric value.
    pub fn raw(&self) -> u32 {
        match self {
            Self::Regular => 0o100644,
            Self::Executable => 0o100755,
            Self::Symlink => 0o120000,
            Self::Gitlink => 0o160000,
            Self::Tree => 0o40000,
        }
    }

    /// Serialize to octal ASCII (canonical format, no leading zero for trees).
    pub fn as_bytes(&self) -> BString {
        BString::from(format!("{:o}", self.raw()))
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, Self::Tree)
    }

    pub fn is_blob(&self) -> bool {
        matches!(self, Self::Regular | Self::Executable | Self::Symlink)
    }

    pub fn is_gitlink(&self) -> bool {
        matches!(self, Self::Gitlink)
    }
}

fn parse_octal(s: &[u8]) -> Option<u32> {
    if s.is_empty() {
        return None;
    }
    let mut val: u32 = 0;
    for &b in s {
        if !(b'0'..=b'7').contains(&b) {
            return None;
        }
        val = val.checked_mul(8)?.checked_add(u32::from(b - b'0'))?;
    }
    Some(val)
}

/// A single entry in a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: FileMode,
    pub name: BString,
    pub oid: ObjectId,
}

impl TreeEntry {
    /// Compare entries using the tree sorting rules: directories sort as if
    /// they had a trailing `/`, so "foo" (dir) sorts after "foo-bar" but
    /// before "foo.c".
    pub fn cmp_entries(a: &TreeEntry, b: &TreeEntry) -> Ordering {
        name_compare(a.name.as_ref(), a.mode.is_tree(), b.name.as_ref(), b.mode.is_tree())
    }
}

fn name_compare(a: &[u8], a_is_tree: bool, b: &[u8], b_is_tree: bool) -> Ordering {
    let common = a.len().min(b.len());
    match a[..common].cmp(&b[..common]) {
        Ordering::Equal => {}
        other => return other,
    }
    let a_next = a.get(common).copied().or(if a_is_tree { Some(b'/') } else { None });
    let b_next = b.get(common).copied().or(if b_is_tree { Some(b'/') } else { None });
    a_next.cmp(&b_next)
}

/// A parsed tree object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Parse tree content (without the object header).
    ///
    /// Format: repeated `"{mode} {name}\0{raw oid}"`.
    pub fn parse(data: &[u8]) -> Result<Self, ObjectError> {
        let mut entries = Vec::new();
        let mut pos = 0;

        while pos < data.len() {
            let space = data[pos..]
                .find_byte(b' ')
                .ok_or_else(|| ObjectError::InvalidTreeEntry {
                    offset: pos,
                    reason: "missing space after mode".into(),
                })?
                + pos;
            let mode = FileMode::from_bytes(&data[pos..space])?;

            let nul = data[space + 1..]
                .find_byte(0)
                .ok_or_else(|| ObjectError::InvalidTreeEntry {
                    offset: space + 1,
                    reason: "missing NUL after name".into(),
                })?
                + space
                + 1;
            let name = BString::from(&data[space + 1..nul]);
            if name.is_empty() {
                return Err(ObjectError::InvalidTreeEntry {
                    offset: space + 1,
                    reason: "empty entry name".into(),
                });
            }

            let oid_start = nul + 1;
            let oid_end = oid_start + OID_RAW_LEN;
            if oid_end > data.len() {
                return Err(ObjectError::InvalidTreeEntry {
                    offset: oid_start,
                    reason: "truncated OID".into(),
                });
            }
            let oid = ObjectId::from_bytes(&data[oid_start..oid_end])?;

            entries.push(TreeEntry { mode, name, oid });
            pos = oid_end;
        }

        Ok(Self { entries })
    }

    /// Serialize to canonical content bytes (entries must already be sorted).
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for entry in &self.entries {
            buf.extend_from_slice(&entry.mode.as_bytes());
            buf.push(b' ');
            buf.extend_from_slice(&entry.name);
            buf.push(0);
            buf.extend_from_slice(entry.oid.as_bytes());
        }
        buf
    }

    /// Look up a direct child by name.
    pub fn entry(&self, name: &BStr) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name.as_bstr() == name)
    }
}
