//! On-disk round trips through contraction and expansion.

use bstr::{BStr, BString};
use mingit_hash::ObjectId;
use mingit_index::{
    cache_tree_update, ConvertResult, Index, IndexEntry, SparseCheckout, SparseSettings,
};
use mingit_object::{FileMode, MemoryStore};

fn oid(n: u8) -> ObjectId {
    let mut raw = [0u8; 20];
    raw[19] = n;
    ObjectId::from_raw(raw)
}

fn tracked(path: &str, n: u8) -> IndexEntry {
    let mut e = IndexEntry::new(path, oid(n), FileMode::Regular);
    e.flags.skip_worktree = true;
    e
}

fn settings() -> SparseSettings {
    SparseSettings {
        sparse_checkout: true,
        cone_mode: true,
        sparse_index: true,
        repo_extension: None,
    }
}

fn project_index() -> Index {
    Index::from_entries(vec![
        tracked("README", 1),
        tracked("docs/guide.md", 2),
        tracked("src/lib.rs", 3),
        tracked("src/sub/mod.rs", 4),
        tracked("vendor/dep/a.c", 5),
        tracked("vendor/dep/b.c", 6),
    ])
}

#[test]
fn contract_write_read_expand_reproduces_the_full_index() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index");

    let mut index = project_index();
    let original: Vec<IndexEntry> = index.entries().to_vec();

    let mut store = MemoryStore::new();
    let patterns = SparseCheckout::cone(["src"]);
    let result = index
        .convert_to_sparse(&settings(), Some(&patterns), &mut store)
        .unwrap();
    assert_eq!(result, ConvertResult::Converted);

    // README survives (top-level file), src/ is in the cone, docs and vendor
    // collapse to single placeholders.
    let paths: Vec<&BString> = index.iter().map(|e| &e.path).collect();
    assert_eq!(
        paths,
        vec![
            &BString::from("README"),
            &BString::from("docs/"),
            &BString::from("src/lib.rs"),
            &BString::from("src/sub/mod.rs"),
            &BString::from("vendor/"),
        ]
    );

    index.write_to(&path).unwrap();
    let mut reread = Index::read_from(&path).unwrap();
    assert!(reread.is_sparse());
    assert_eq!(reread.entries(), index.entries());

    reread.ensure_full_index(&store).unwrap();
    assert!(!reread.is_sparse());
    assert_eq!(reread.entries(), original.as_slice());

    // A full index writes without the sparse marker and reads back full.
    let full_path = dir.path().join("index-full");
    reread.write_to(&full_path).unwrap();
    let full = Index::read_from(&full_path).unwrap();
    assert!(!full.is_sparse());
    assert_eq!(full.entries(), original.as_slice());
}

#[test]
fn deep_cone_keeps_ancestor_files_materialized() {
    let mut index = Index::from_entries(vec![
        tracked("a/top.txt", 1),
        tracked("a/b/keep.txt", 2),
        tracked("a/b/c/deep.txt", 3),
        tracked("a/other/skip.txt", 4),
        tracked("z/skip.txt", 5),
    ]);
    let mut store = MemoryStore::new();
    let patterns = SparseCheckout::cone(["a/b"]);

    index
        .convert_to_sparse(&settings(), Some(&patterns), &mut store)
        .unwrap();

    // `a` is an ancestor of the cone: its direct files stay, its unrelated
    // subtree collapses. `z` collapses wholesale.
    let paths: Vec<&BString> = index.iter().map(|e| &e.path).collect();
    assert_eq!(
        paths,
        vec![
            &BString::from("a/b/c/deep.txt"),
            &BString::from("a/b/keep.txt"),
            &BString::from("a/other/"),
            &BString::from("a/top.txt"),
            &BString::from("z/"),
        ]
    );

    // Targeted expansion of a path under a collapsed subtree restores the
    // full index.
    index.expand_to_path(&store, BStr::new(b"z/skip.txt")).unwrap();
    assert_eq!(index.len(), 5);
    assert!(index.iter().all(|e| !e.is_sparse_dir()));
}

#[test]
fn cache_tree_written_before_contraction_is_dropped_after() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index");

    let mut index = project_index();
    let mut store = MemoryStore::new();
    let tree = cache_tree_update(&index, &mut store).unwrap();
    index.set_cache_tree(Some(tree));
    index.write_to(&path).unwrap();

    let mut reread = Index::read_from(&path).unwrap();
    assert!(reread.cache_tree().is_some());

    let patterns = SparseCheckout::cone(["src"]);
    reread
        .convert_to_sparse(&settings(), Some(&patterns), &mut store)
        .unwrap();
    // Marked for rebuild on next save.
    assert!(reread.cache_tree().is_none());
}
