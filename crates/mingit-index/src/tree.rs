//! Cache tree: a hierarchical summary of tree OIDs aligned with the index.
//!
//! Each node covers a contiguous span of index entries sharing a path prefix
//! and records how many entries that span holds; child nodes cover the
//! sub-spans of each immediate subdirectory. A node with `entry_count >= 0`
//! is valid: its OID is the hash of the tree object for that subtree.
//! Serialized into the index as the `TREE` extension.

use bstr::{BStr, BString, ByteSlice};
use mingit_hash::{ObjectId, OID_RAW_LEN};

use crate::IndexError;

/// Cache tree extension — cached tree OIDs for spans of index entries.
#[derive(Debug, Clone)]
pub struct CacheTree {
    pub root: CacheTreeNode,
}

/// A single node in the cache tree.
#[derive(Debug, Clone)]
pub struct CacheTreeNode {
    /// Name of this subtree (empty for the root).
    pub name: BString,
    /// Number of index entries covered (-1 = invalid).
    pub entry_count: i32,
    /// Tree OID (present only while valid).
    pub oid: Option<ObjectId>,
    /// Child subtrees, sorted by name for binary search.
    pub children: Vec<CacheTreeNode>,
}

impl CacheTreeNode {
    /// Is this node's span and OID trustworthy?
    pub fn is_valid(&self) -> bool {
        self.entry_count >= 0 && self.oid.is_some()
    }

    /// Binary-search the child subtree with the given name.
    pub fn subtree_pos(&self, name: &[u8]) -> Option<usize> {
        self.children
            .binary_search_by(|c| c.name.as_slice().cmp(name))
            .ok()
    }

    /// Convenience: the child subtree with the given name.
    pub fn subtree(&self, name: &[u8]) -> Option<&CacheTreeNode> {
        self.subtree_pos(name).map(|pos| &self.children[pos])
    }
}

impl CacheTree {
    /// Extension signature.
    pub const SIGNATURE: &'static [u8; 4] = b"TREE";

    /// Parse a TREE extension payload.
    ///
    /// Each node is `name NUL entry_count SP subtree_count LF [oid]`, with
    /// the root's name being empty and the OID present only for valid nodes.
    pub fn parse(data: &[u8]) -> Result<Self, IndexError> {
        let mut cursor = 0;
        // Root node: skip the NUL terminating the empty name.
        if data.first() == Some(&0) {
            cursor += 1;
        }
        let root = Self::parse_node(data, &mut cursor, b"")?;
        Ok(CacheTree { root })
    }

    fn parse_node(data: &[u8], cursor: &mut usize, name: &[u8]) -> Result<CacheTreeNode, IndexError> {
        let entry_count: i32 = read_ascii_number(data, cursor, b' ')?;
        let subtree_count: usize = read_ascii_number(data, cursor, b'\n')?;

        let oid = if entry_count >= 0 {
            if *cursor + OID_RAW_LEN > data.len() {
                return Err(invalid_tree("truncated OID"));
            }
            let oid = ObjectId::from_bytes(&data[*cursor..*cursor + OID_RAW_LEN])
                .map_err(|_| invalid_tree("invalid OID"))?;
            *cursor += OID_RAW_LEN;
            Some(oid)
        } else {
            None
        };

        let mut children = Vec::with_capacity(subtree_count);
        for _ in 0..subtree_count {
            let name_end = data[*cursor..]
                .find_byte(0)
                .ok_or_else(|| invalid_tree("missing child name"))?
                + *cursor;
            let child_name = &data[*cursor..name_end];
            *cursor = name_end + 1;
            children.push(Self::parse_node(data, cursor, child_name)?);
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(CacheTreeNode {
            name: BString::from(name),
            entry_count,
            oid,
            children,
        })
    }

    /// Serialize to the TREE extension payload.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        Self::serialize_node(&self.root, &mut buf, true);
        buf
    }

    fn serialize_node(node: &CacheTreeNode, buf: &mut Vec<u8>, is_root: bool) {
        if !is_root {
            buf.extend_from_slice(&node.name);
        }
        buf.push(0);
        buf.extend_from_slice(node.entry_count.to_string().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(node.children.len().to_string().as_bytes());
        buf.push(b'\n');
        if node.entry_count >= 0 {
            if let Some(ref oid) = node.oid {
                buf.extend_from_slice(oid.as_bytes());
            }
        }
        for child in &node.children {
            Self::serialize_node(child, buf, false);
        }
    }

    /// Invalidate the nodes covering `path` and all their ancestors.
    pub fn invalidate(&mut self, path: &BStr) {
        Self::invalidate_node(&mut self.root, path.as_bytes());
    }

    fn invalidate_node(node: &mut CacheTreeNode, path: &[u8]) -> bool {
        match path.find_byte(b'/') {
            Some(pos) => {
                let (component, rest) = (&path[..pos], &path[pos + 1..]);
                if let Ok(idx) = node.children.binary_search_by(|c| c.name.as_slice().cmp(component))
                {
                    if Self::invalidate_node(&mut node.children[idx], rest) {
                        node.entry_count = -1;
                        node.oid = None;
                        return true;
                    }
                }
                false
            }
            None => {
                node.entry_count = -1;
                node.oid = None;
                true
            }
        }
    }

    /// The root tree OID, if the whole tree is valid.
    pub fn root_oid(&self) -> Option<&ObjectId> {
        if self.root.entry_count >= 0 {
            self.root.oid.as_ref()
        } else {
            None
        }
    }
}

fn invalid_tree(reason: &str) -> IndexError {
    IndexError::InvalidExtension {
        sig: "TREE".into(),
        reason: reason.into(),
    }
}

fn read_ascii_number<T: std::str::FromStr>(
    data: &[u8],
    cursor: &mut usize,
    terminator: u8,
) -> Result<T, IndexError> {
    let end = data[*cursor..]
        .find_byte(terminator)
        .ok_or_else(|| invalid_tree("missing field terminator"))?
        + *cursor;
    let text = std::str::from_utf8(&data[*cursor..end]).map_err(|_| invalid_tree("bad number"))?;
    let value = text.parse().map_err(|_| invalid_tree("bad number"))?;
    *cursor = end + 1;
    Ok(value)
}
