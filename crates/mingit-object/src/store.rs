//! The object-source capability consumed by the index subsystems.
//!
//! The real object database (loose files, packs, alternates) lives outside
//! this workspace; everything here only needs to *read trees* and, for the
//! cache-tree builder, *write trees*. [`MemoryStore`] backs tests and any
//! embedder without a full store.

use std::collections::HashMap;

use bstr::BString;
use mingit_hash::hasher::Hasher;
use mingit_hash::ObjectId;

use crate::{ObjectError, Tree};

/// Read access to tree objects.
pub trait TreeSource {
    /// Load and parse the tree with the given id.
    fn read_tree(&self, oid: &ObjectId) -> Result<Tree, ObjectError>;
}

/// Write access for components that materialize trees (cache-tree update).
pub trait TreeSink {
    /// Store a tree, returning its content hash.
    fn write_tree(&mut self, tree: &Tree) -> Result<ObjectId, ObjectError>;
}

/// An in-memory tree store keyed by content hash.
#[derive(Debug, Default)]
pub struct MemoryStore {
    trees: HashMap<ObjectId, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored trees.
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    /// Insert a tree by value, returning its id.
    pub fn insert_tree(&mut self, tree: &Tree) -> Result<ObjectId, ObjectError> {
        let content = tree.serialize();
        let oid = Hasher::hash_object("tree", &content)?;
        self.trees.insert(oid, content);
        Ok(oid)
    }
}

impl TreeSource for MemoryStore {
    fn read_tree(&self, oid: &ObjectId) -> Result<Tree, ObjectError> {
        let content = self.trees.get(oid).ok_or(ObjectError::NotFound(*oid))?;
        Tree::parse(content)
    }
}

impl TreeSink for MemoryStore {
    fn write_tree(&mut self, tree: &Tree) -> Result<ObjectId, ObjectError> {
        self.insert_tree(tree)
    }
}

/// Walk the tree rooted at `root` depth-first, invoking `visit` for every
/// non-tree entry with its full path (relative to `base`) and the entry
/// itself. Subtrees are loaded through `source` on demand.
pub fn read_tree_recursive<F>(
    source: &dyn TreeSource,
    root: &ObjectId,
    base: &[u8],
    visit: &mut F,
) -> Result<(), ObjectError>
where
    F: FnMut(&BString, &crate::TreeEntry) -> Result<(), ObjectError>,
{
    let tree = source.read_tree(root)?;
    for entry in &tree.entries {
        let mut path = BString::from(base);
        path.extend_from_slice(&entry.name);
        if entry.mode.is_tree() {
            path.push(b'/');
            read_tree_recursive(source, &entry.oid, &path, visit)?;
        } else {
            visit(&path, entry)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileMode, TreeEntry};

    fn blob_oid(n: u8) -> ObjectId {
        let mut raw = [0u8; 20];
        raw[19] = n;
        ObjectId::from_raw(raw)
    }

    #[test]
    fn memory_store_roundtrip() {
        let mut store = MemoryStore::new();
        let tree = Tree {
            entries: vec![TreeEntry {
                mode: FileMode::Regular,
                name: "file".into(),
                oid: blob_oid(1),
            }],
        };
        let oid = store.insert_tree(&tree).unwrap();
        assert_eq!(store.read_tree(&oid).unwrap(), tree);
    }

    #[test]
    fn missing_tree_is_not_found() {
        let store = MemoryStore::new();
        let err = store.read_tree(&blob_oid(9)).unwrap_err();
        assert!(matches!(err, ObjectError::NotFound(_)));
    }

    #[test]
    fn recursive_walk_yields_full_paths() {
        let mut store = MemoryStore::new();
        let inner = Tree {
            entries: vec![TreeEntry {
                mode: FileMode::Regular,
                name: "f".into(),
                oid: blob_oid(1),
            }],
        };
        let inner_oid = store.insert_tree(&inner).unwrap();
        let outer = Tree {
            entries: vec![
                TreeEntry { mode: FileMode::Regular, name: "a".into(), oid: blob_oid(2) },
                TreeEntry { mode: FileMode::Tree, name: "d".into(), oid: inner_oid },
            ],
        };
        let outer_oid = store.insert_tree(&outer).unwrap();

        let mut seen = Vec::new();
        read_tree_recursive(&store, &outer_oid, b"top/", &mut |path, entry| {
            seen.push((path.clone(), entry.oid));
            Ok(())
        })
        .unwrap();

        assert_eq!(
            seen,
            vec![
                (BString::from("top/a"), blob_oid(2)),
                (BString::from("top/d/f"), blob_oid(1)),
            ]
        );
    }
}
