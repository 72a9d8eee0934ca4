//! Sparse-index contraction and expansion.
//!
//! Contraction walks the cache tree alongside the full entry array and
//! replaces every subtree that lies wholly outside the sparse cone with one
//! sparse-directory entry. Expansion reads the referenced tree objects back
//! into file entries, either wholesale or when a caller needs one specific
//! path to exist as an ordinary entry.

use bstr::{BStr, BString, ByteSlice};
use mingit_object::store::{read_tree_recursive, TreeSink, TreeSource};
use tracing::{debug, warn};

use crate::entry::IndexEntry;
use crate::sparse::{PatternMatch, SparseCheckout};
use crate::tree::CacheTreeNode;
use crate::write::cache_tree_update;
use crate::{Index, IndexError, Stage};

/// Configuration gates for the sparse representation, supplied by the
/// repository plumbing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SparseSettings {
    /// `core.sparseCheckout`: sparse-checkout is enabled at all.
    pub sparse_checkout: bool,
    /// `core.sparseCheckoutCone`: the pattern set is a directory cone.
    pub cone_mode: bool,
    /// `index.sparse`: the configuration key asking for a sparse index.
    pub sparse_index: bool,
    /// Repository-format extension marker, when the repository declares one.
    pub repo_extension: Option<bool>,
}

/// Environment override consulted before any configuration.
pub const SPARSE_INDEX_ENV: &str = "SPARSE_INDEX_TEST";

impl SparseSettings {
    /// Should the sparse representation be used?
    ///
    /// Precedence: `SPARSE_INDEX_TEST=0|1` environment override, then the
    /// repository-format extension marker, then the configuration key.
    pub fn sparse_index_wanted(&self) -> bool {
        match std::env::var(SPARSE_INDEX_ENV).ok().as_deref() {
            Some("1") => true,
            Some("0") => false,
            _ => self.repo_extension.unwrap_or(self.sparse_index),
        }
    }
}

/// What a conversion attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertResult {
    /// The entry array was rewritten.
    Converted,
    /// Already sparse; converting again is a no-op.
    AlreadySparse,
    /// Sparse checkout, cone mode, or the sparse index itself is disabled.
    Disabled,
    /// Split indexes keep their full representation.
    SplitIndex,
    /// No pattern set was available.
    NoPatterns,
    /// The cache tree could not be brought up to date.
    CacheTreeInvalid,
}

impl Index {
    /// Contract the index to the sparse representation.
    ///
    /// Precondition failures other than a non-cone pattern set return a
    /// benign [`ConvertResult`] without touching the index; a non-cone
    /// pattern set with the sparse index requested is the caller's error.
    pub fn convert_to_sparse(
        &mut self,
        settings: &SparseSettings,
        patterns: Option<&SparseCheckout>,
        sink: &mut dyn TreeSink,
    ) -> Result<ConvertResult, IndexError> {
        if self.is_sparse() {
            return Ok(ConvertResult::AlreadySparse);
        }
        if self.split_index() {
            return Ok(ConvertResult::SplitIndex);
        }
        if !settings.sparse_checkout || !settings.cone_mode || !settings.sparse_index_wanted() {
            return Ok(ConvertResult::Disabled);
        }
        let Some(patterns) = patterns else {
            return Ok(ConvertResult::NoPatterns);
        };
        if !patterns.use_cone_patterns() {
            warn!("attempting to use the sparse index without cone-mode patterns");
            return Err(IndexError::NonConePatterns);
        }

        let cache_tree = match cache_tree_update(self, sink) {
            Ok(tree) => tree,
            Err(err) => {
                warn!(%err, "unable to update cache tree, staying full");
                return Ok(ConvertResult::CacheTreeInvalid);
            }
        };

        let mut converted = Vec::with_capacity(self.len());
        convert_to_sparse_rec(
            self.entries(),
            &mut converted,
            0,
            self.len(),
            b"",
            &cache_tree.root,
            patterns,
        );
        debug!(before = self.len(), after = converted.len(), "contracted index");
        self.replace_entries(converted);

        // The cache tree no longer lines up with the entry array; rebuild on
        // next save. The filesystem monitor's path domain is stale too.
        self.set_cache_tree(None);
        self.set_fsmonitor(None);
        let has_sparse_dirs = self.iter().any(IndexEntry::is_sparse_dir);
        self.set_sparse(has_sparse_dirs);
        Ok(ConvertResult::Converted)
    }

    /// Expand every sparse-directory entry back into file entries.
    pub fn ensure_full_index(&mut self, source: &dyn TreeSource) -> Result<(), IndexError> {
        if !self.is_sparse() {
            return Ok(());
        }
        let was_expanding = self.expanding;
        self.expanding = true;
        let result = self.expand_all(source);
        self.expanding = was_expanding;
        result
    }

    fn expand_all(&mut self, source: &dyn TreeSource) -> Result<(), IndexError> {
        let mut full: Vec<IndexEntry> = Vec::with_capacity(self.len() * 3 / 2 + 1);

        for entry in self.entries() {
            if !entry.is_sparse_dir() {
                full.push(entry.clone());
                continue;
            }
            if !entry.flags.skip_worktree {
                // Inconsistent but expandable; never silently rewritten.
                warn!(path = %entry.path, "sparse-directory entry without skip-worktree bit");
            }
            read_tree_recursive(source, &entry.oid, &entry.path, &mut |path, tree_entry| {
                let mut materialized = IndexEntry::new(path.clone(), tree_entry.oid, tree_entry.mode);
                materialized.flags.skip_worktree = true;
                full.push(materialized);
                Ok(())
            })?;
        }

        debug!(before = self.len(), after = full.len(), "expanded index");
        self.replace_entries(full);
        self.set_sparse(false);
        Ok(())
    }

    /// Make `path` present as an ordinary entry if a sparse-directory entry
    /// currently stands in for it.
    ///
    /// A targeted expand invoked while another expand is running is a no-op:
    /// the pattern-match and tree-read machinery may themselves consult the
    /// index.
    pub fn expand_to_path(&mut self, source: &dyn TreeSource, path: &BStr) -> Result<(), IndexError> {
        if self.expanding {
            return Ok(());
        }
        if !self.is_sparse() {
            return Ok(());
        }
        if self.contains_path(path) {
            return Ok(());
        }

        // Probe every directory prefix of the path for a sparse-directory
        // entry standing in for it.
        let bytes = path.as_bytes();
        let mut probe = BString::from("");
        let mut covered = false;
        for (i, &b) in bytes.iter().enumerate() {
            if b == b'/' {
                probe.clear();
                probe.extend_from_slice(&bytes[..=i]);
                if let Some(entry) = self.entry_with_path(probe.as_bstr()) {
                    if entry.is_sparse_dir() {
                        covered = true;
                    }
                    break;
                }
            }
        }

        if covered {
            debug!(path = %path, "expanding sparse index for targeted path");
            self.ensure_full_index(source)?;
        }
        Ok(())
    }

    fn entry_with_path(&self, path: &BStr) -> Option<&IndexEntry> {
        self.entries()
            .binary_search_by(|e| e.path.as_slice().cmp(path.as_bytes()))
            .ok()
            .map(|pos| &self.entries()[pos])
    }
}

/// Recursive contraction over one cache-tree node covering
/// `entries[start..end]`. Emits into `out` and relies on every visited node
/// being valid, which `cache_tree_update` just established.
fn convert_to_sparse_rec(
    entries: &[IndexEntry],
    out: &mut Vec<IndexEntry>,
    start: usize,
    end: usize,
    ct_path: &[u8],
    ct: &CacheTreeNode,
    patterns: &SparseCheckout,
) {
    // A subtree inside the cone can never collapse; outside it, the span
    // must also be conflict-free, submodule-free, and entirely skip-worktree.
    let mut can_convert = ct.is_valid()
        && patterns.match_dir(BStr::new(ct_path)) == PatternMatch::NotMatched;

    if can_convert {
        for entry in &entries[start..end] {
            if entry.stage != Stage::Normal
                || entry.mode.is_gitlink()
                || !entry.flags.skip_worktree
            {
                can_convert = false;
                break;
            }
        }
    }

    if can_convert {
        let oid = ct.oid.expect("valid node has an OID");
        out.push(IndexEntry::sparse_dir(BStr::new(ct_path), oid));
        return;
    }

    let mut i = start;
    while i < end {
        let entry = &entries[i];
        let base = &entry.path[ct_path.len()..];

        // A direct file of this directory, or a subtree the cache tree does
        // not know, passes through verbatim.
        let subtree = base
            .find_byte(b'/')
            .and_then(|slash| ct.subtree(&base[..slash]).map(|child| (slash, child)))
            .filter(|(_, child)| child.is_valid());

        let Some((slash, child)) = subtree else {
            out.push(entry.clone());
            i += 1;
            continue;
        };

        let child_path = &entry.path[..ct_path.len() + slash + 1];
        let span = child.entry_count as usize;
        convert_to_sparse_rec(entries, out, i, i + span, child_path, child, patterns);
        i += span;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bstr::BString;
    use mingit_hash::ObjectId;
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

    fn enabled_settings() -> SparseSettings {
        SparseSettings {
            sparse_checkout: true,
            cone_mode: true,
            sparse_index: true,
            repo_extension: None,
        }
    }

    fn sample_index() -> Index {
        Index::from_entries(vec![
            tracked("a", 1),
            tracked("b/c", 2),
            tracked("b/d", 3),
            tracked("b/e/f", 4),
        ])
    }

    #[test]
    fn settings_precedence_env_extension_config() {
        // Config alone decides when nothing else is set.
        let config_only = SparseSettings { sparse_index: true, ..Default::default() };
        assert!(config_only.sparse_index_wanted());

        // The repository extension overrides the config key.
        let ext_off = SparseSettings {
            sparse_index: true,
            repo_extension: Some(false),
            ..Default::default()
        };
        assert!(!ext_off.sparse_index_wanted());

        let ext_on = SparseSettings {
            sparse_index: false,
            repo_extension: Some(true),
            ..Default::default()
        };
        assert!(ext_on.sparse_index_wanted());
    }

    #[test]
    fn contracts_outside_cone_to_single_entry() {
        let mut index = sample_index();
        let mut store = MemoryStore::new();
        let patterns = SparseCheckout::cone(["a"]);

        let result = index
            .convert_to_sparse(&enabled_settings(), Some(&patterns), &mut store)
            .unwrap();
        assert_eq!(result, ConvertResult::Converted);
        assert!(index.is_sparse());

        let paths: Vec<&BString> = index.iter().map(|e| &e.path).collect();
        assert_eq!(paths, vec![&BString::from("a"), &BString::from("b/")]);

        let b = &index.entries()[1];
        assert!(b.is_sparse_dir());
        assert!(b.flags.skip_worktree);
        // The placeholder's OID is the cache-tree OID of subtree b, which the
        // store can resolve back to c, d, and e/.
        let tree = store.read_tree(&b.oid).unwrap();
        let names: Vec<&BString> = tree.entries.iter().map(|e| &e.name).collect();
        assert_eq!(names, vec![&BString::from("c"), &BString::from("d"), &BString::from("e")]);
    }

    #[test]
    fn contraction_is_idempotent() {
        let mut index = sample_index();
        let mut store = MemoryStore::new();
        let patterns = SparseCheckout::cone(["a"]);
        index
            .convert_to_sparse(&enabled_settings(), Some(&patterns), &mut store)
            .unwrap();
        let entries_before = index.entries().to_vec();

        let again = index
            .convert_to_sparse(&enabled_settings(), Some(&patterns), &mut store)
            .unwrap();
        assert_eq!(again, ConvertResult::AlreadySparse);
        assert_eq!(index.entries(), entries_before.as_slice());
    }

    #[test]
    fn preconditions_skip_benignly() {
        let mut store = MemoryStore::new();
        let patterns = SparseCheckout::cone(["a"]);

        let mut disabled = sample_index();
        let settings = SparseSettings { sparse_checkout: false, ..enabled_settings() };
        assert_eq!(
            disabled
                .convert_to_sparse(&settings, Some(&patterns), &mut store)
                .unwrap(),
            ConvertResult::Disabled
        );

        let mut split = sample_index();
        split.set_split_index(true);
        assert_eq!(
            split
                .convert_to_sparse(&enabled_settings(), Some(&patterns), &mut store)
                .unwrap(),
            ConvertResult::SplitIndex
        );

        let mut no_patterns = sample_index();
        assert_eq!(
            no_patterns
                .convert_to_sparse(&enabled_settings(), None, &mut store)
                .unwrap(),
            ConvertResult::NoPatterns
        );
    }

    #[test]
    fn non_cone_patterns_are_an_error() {
        let mut index = sample_index();
        let mut store = MemoryStore::new();
        let patterns = SparseCheckout::parse(b"*.rs\n");
        let err = index
            .convert_to_sparse(&enabled_settings(), Some(&patterns), &mut store)
            .unwrap_err();
        assert!(matches!(err, IndexError::NonConePatterns));
        assert!(!index.is_sparse());
    }

    #[test]
    fn merge_stage_blocks_conversion() {
        // A conflicted entry means no tree can summarize its span; the
        // conversion stays full and reports the cache tree failure.
        let mut conflicted = tracked("b/d", 3);
        conflicted.stage = Stage::Ours;
        let mut index = Index::from_entries(vec![
            tracked("a", 1),
            tracked("b/c", 2),
            conflicted,
            tracked("b/e/f", 4),
        ]);
        let before = index.entries().to_vec();

        let mut store = MemoryStore::new();
        let patterns = SparseCheckout::cone(["a"]);
        let result = index
            .convert_to_sparse(&enabled_settings(), Some(&patterns), &mut store)
            .unwrap();
        assert_eq!(result, ConvertResult::CacheTreeInvalid);
        assert_eq!(index.entries(), before.as_slice());
        assert!(!index.is_sparse());
    }

    #[test]
    fn recursion_never_collapses_staged_or_gitlink_or_materialized_spans() {
        // Exercise the span checks directly with a handcrafted cache tree:
        // outside the cone, but the span holds entries the contractor must
        // refuse to fold away.
        let cases: Vec<(&str, Box<dyn Fn(&mut IndexEntry)>)> = vec![
            ("stage", Box::new(|e| e.stage = Stage::Theirs)),
            ("gitlink", Box::new(|e| e.mode = FileMode::Gitlink)),
            ("materialized", Box::new(|e| e.flags.skip_worktree = false)),
        ];

        for (label, poison) in cases {
            let mut entry = tracked("b/c", 2);
            poison(&mut entry);
            let entries = vec![tracked("a", 1), entry, tracked("b/d", 3)];

            let node = CacheTreeNode {
                name: BString::from(""),
                entry_count: 3,
                oid: Some(oid(7)),
                children: vec![CacheTreeNode {
                    name: BString::from("b"),
                    entry_count: 2,
                    oid: Some(oid(8)),
                    children: vec![],
                }],
            };
            let patterns = SparseCheckout::cone(["a"]);

            let mut out = Vec::new();
            convert_to_sparse_rec(&entries, &mut out, 0, entries.len(), b"", &node, &patterns);
            assert_eq!(out.as_slice(), entries.as_slice(), "case {label}");
        }
    }

    #[test]
    fn full_sparse_full_roundtrip() {
        let mut index = sample_index();
        let original = index.entries().to_vec();

        let mut store = MemoryStore::new();
        let patterns = SparseCheckout::cone(["a"]);
        index
            .convert_to_sparse(&enabled_settings(), Some(&patterns), &mut store)
            .unwrap();
        assert_eq!(index.len(), 2);

        index.ensure_full_index(&store).unwrap();
        assert!(!index.is_sparse());
        assert_eq!(index.entries(), original.as_slice());
    }

    #[test]
    fn expand_to_path_materializes_covered_path() {
        let mut index = sample_index();
        let mut store = MemoryStore::new();
        let patterns = SparseCheckout::cone(["a"]);
        index
            .convert_to_sparse(&enabled_settings(), Some(&patterns), &mut store)
            .unwrap();

        index.expand_to_path(&store, BStr::new(b"b/e/f")).unwrap();
        let paths: Vec<&BString> = index.iter().map(|e| &e.path).collect();
        assert_eq!(
            paths,
            vec![
                &BString::from("a"),
                &BString::from("b/c"),
                &BString::from("b/d"),
                &BString::from("b/e/f"),
            ]
        );
    }

    #[test]
    fn expand_to_path_ignores_uncovered_paths() {
        let mut index = sample_index();
        let mut store = MemoryStore::new();
        let patterns = SparseCheckout::cone(["a"]);
        index
            .convert_to_sparse(&enabled_settings(), Some(&patterns), &mut store)
            .unwrap();
        let sparse_entries = index.entries().to_vec();

        // Present path: nothing to do.
        index.expand_to_path(&store, BStr::new(b"a")).unwrap();
        // Path under no sparse directory: nothing to do either.
        index.expand_to_path(&store, BStr::new(b"z/q")).unwrap();
        assert_eq!(index.entries(), sparse_entries.as_slice());
    }

    #[test]
    fn expand_to_path_is_reentrancy_guarded() {
        let mut index = sample_index();
        let mut store = MemoryStore::new();
        let patterns = SparseCheckout::cone(["a"]);
        index
            .convert_to_sparse(&enabled_settings(), Some(&patterns), &mut store)
            .unwrap();

        // Simulate being called from inside another expand.
        index.expanding = true;
        index.expand_to_path(&store, BStr::new(b"b/e/f")).unwrap();
        assert_eq!(index.len(), 2, "reentrant targeted expand must be a no-op");
        index.expanding = false;
    }

    #[test]
    fn expand_warns_but_proceeds_without_skip_worktree() {
        // Build a sparse index whose placeholder lost its skip-worktree bit.
        let mut store = MemoryStore::new();
        let mut index = sample_index();
        let patterns = SparseCheckout::cone(["a"]);
        index
            .convert_to_sparse(&enabled_settings(), Some(&patterns), &mut store)
            .unwrap();

        let mut entries = index.entries().to_vec();
        entries[1].flags.skip_worktree = false;
        let mut index = Index::from_entries(entries);

        index.ensure_full_index(&store).unwrap();
        assert_eq!(index.len(), 4);
        assert!(!index.is_sparse());
    }

    #[test]
    fn conversion_drops_fsmonitor_and_cache_tree() {
        let mut index = sample_index();
        index.set_fsmonitor(Some(b"token".to_vec()));
        let mut store = MemoryStore::new();
        let patterns = SparseCheckout::cone(["a"]);
        index
            .convert_to_sparse(&enabled_settings(), Some(&patterns), &mut store)
            .unwrap();

        assert!(index.fsmonitor().is_none());
        assert!(index.cache_tree().is_none());
    }

    #[test]
    fn everything_inside_cone_converts_to_itself() {
        let mut index = sample_index();
        let original = index.entries().to_vec();
        let mut store = MemoryStore::new();
        let patterns = SparseCheckout::cone(["a", "b"]);

        let result = index
            .convert_to_sparse(&enabled_settings(), Some(&patterns), &mut store)
            .unwrap();
        // Conversion ran but produced no placeholders, so the index stays
        // flagged full.
        assert_eq!(result, ConvertResult::Converted);
        assert!(!index.is_sparse());
        assert_eq!(index.entries(), original.as_slice());
    }
}
