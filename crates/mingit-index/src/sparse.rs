//! Sparse-checkout pattern handling.
//!
//! Cone mode restricts patterns to a hierarchical directory-inclusion set:
//! top-level files are always present, every ancestor of an included
//! directory contributes its direct files, and everything under an included
//! directory is present recursively. Non-cone pattern files are detected and
//! carried opaquely; matching them is the pattern engine's job, not ours, and
//! the sparse index refuses to work from them.

use std::path::Path;

use bstr::{BStr, BString, ByteSlice};

/// How a directory relates to the sparse cone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternMatch {
    /// Entirely outside the cone; candidate for collapsing.
    NotMatched,
    /// An ancestor of a cone directory: direct files are in, subtrees vary.
    Matched,
    /// Inside the cone; everything below is materialized.
    MatchedRecursive,
}

/// Parsed sparse-checkout configuration.
#[derive(Debug, Clone, Default)]
pub struct SparseCheckout {
    cone_mode: bool,
    /// Cone directories, normalized (no leading or trailing slash).
    cone_dirs: Vec<BString>,
    /// Raw pattern lines of a non-cone file, kept for listing only.
    raw_patterns: Vec<BString>,
}

impl SparseCheckout {
    /// Build a cone-mode pattern set from directory paths.
    ///
    /// Each input is one directory: leading slash optional, trailing slash
    /// stripped, empty lines ignored.
    pub fn cone<I, S>(dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut cone_dirs: Vec<BString> = dirs
            .into_iter()
            .filter_map(|d| normalize_dir(d.as_ref()))
            .collect();
        cone_dirs.sort();
        cone_dirs.dedup();
        Self {
            cone_mode: true,
            cone_dirs,
            raw_patterns: Vec::new(),
        }
    }

    /// Is this a cone-mode pattern set?
    pub fn use_cone_patterns(&self) -> bool {
        self.cone_mode
    }

    /// The cone directories, sorted.
    pub fn cone_dirs(&self) -> &[BString] {
        &self.cone_dirs
    }

    /// Classify a directory path against the cone.
    ///
    /// The root (empty path) is always at least `Matched`: its direct files
    /// are part of every cone. A trailing slash on `dir` is ignored. Non-cone
    /// pattern sets conservatively report `Matched` so nothing collapses.
    pub fn match_dir(&self, dir: &BStr) -> PatternMatch {
        if !self.cone_mode {
            return PatternMatch::Matched;
        }
        let dir = strip_slashes(dir.as_bytes());
        if dir.is_empty() {
            return PatternMatch::Matched;
        }

        for cone in &self.cone_dirs {
            if dir == cone.as_slice() || is_under(dir, cone) {
                return PatternMatch::MatchedRecursive;
            }
        }
        if self.cone_dirs.iter().any(|cone| is_under(cone, dir)) {
            return PatternMatch::Matched;
        }
        PatternMatch::NotMatched
    }

    /// Load from a sparse-checkout pattern file.
    ///
    /// A missing file yields an empty cone set. Files that do not follow the
    /// restricted cone shape are loaded as non-cone patterns.
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let content = match std::fs::read(path.as_ref()) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::cone::<_, &[u8]>([])),
            Err(e) => return Err(e),
        };
        Ok(Self::parse(&content))
    }

    /// Parse pattern-file content.
    pub fn parse(content: &[u8]) -> Self {
        let mut positives: Vec<BString> = Vec::new();
        let mut negatives: Vec<BString> = Vec::new();
        let mut raw: Vec<BString> = Vec::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line[0] == b'#' {
                continue;
            }
            raw.push(BString::from(line));
            if line[0] == b'!' {
                negatives.push(BString::from(&line[1..]));
            } else {
                positives.push(BString::from(line));
            }
        }

        if !cone_shaped(&positives, &negatives) {
            return Self {
                cone_mode: false,
                cone_dirs: Vec::new(),
                raw_patterns: raw,
            };
        }

        // A positive "/dir/" is a cone directory unless a matching
        // "!/dir/*/" marks it as a mere ancestor.
        let mut cone_dirs = Vec::new();
        for pattern in &positives {
            if pattern.as_slice() == b"/*" {
                continue;
            }
            let dir = unescape(&pattern[1..pattern.len() - 1]);
            let mut ancestor_marker = BString::from(&pattern[..]);
            ancestor_marker.extend_from_slice(b"*/");
            if !negatives.iter().any(|n| *n == ancestor_marker) {
                cone_dirs.push(dir);
            }
        }
        cone_dirs.sort();
        cone_dirs.dedup();

        Self {
            cone_mode: true,
            cone_dirs,
            raw_patterns: Vec::new(),
        }
    }

    /// Render as pattern-file content.
    ///
    /// Cone sets serialize to the restricted shape (`/*`, `!/*/`, then one
    /// `/dir/` per directory, with `!/dir/*/` after each non-leaf ancestor);
    /// glob metacharacters in directory names are escaped. Non-cone sets are
    /// written back verbatim.
    pub fn to_content(&self) -> BString {
        let mut out = BString::from("");
        if !self.cone_mode {
            for line in &self.raw_patterns {
                out.extend_from_slice(line);
                out.push(b'\n');
            }
            return out;
        }

        out.extend_from_slice(b"/*\n!/*/\n");

        // Emit every ancestor once, in sorted order, marking non-leaves.
        let mut dirs: Vec<BString> = Vec::new();
        for dir in &self.cone_dirs {
            let mut prefix_len = 0;
            let bytes = dir.as_slice();
            loop {
                match bytes[prefix_len..].find_byte(b'/') {
                    Some(pos) => {
                        prefix_len += pos;
                        dirs.push(BString::from(&bytes[..prefix_len]));
                        prefix_len += 1;
                    }
                    None => {
                        dirs.push(dir.clone());
                        break;
                    }
                }
            }
        }
        dirs.sort();
        dirs.dedup();

        for dir in &dirs {
            let is_leaf_or_inside = self
                .cone_dirs
                .iter()
                .any(|cone| dir == cone || is_under(dir, cone));
            out.push(b'/');
            out.extend_from_slice(&escape(dir));
            out.extend_from_slice(b"/\n");
            if !is_leaf_or_inside {
                out.push(b'!');
                out.push(b'/');
                out.extend_from_slice(&escape(dir));
                out.extend_from_slice(b"/*/\n");
            }
        }
        out
    }

    /// Write the pattern file, creating parent directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), self.to_content())
    }
}

/// `child` is strictly below directory `parent`.
fn is_under(child: &[u8], parent: &[u8]) -> bool {
    child.len() > parent.len()
        && child.starts_with(parent)
        && child[parent.len()] == b'/'
}

fn strip_slashes(mut dir: &[u8]) -> &[u8] {
    if dir.first() == Some(&b'/') {
        dir = &dir[1..];
    }
    if dir.last() == Some(&b'/') {
        dir = &dir[..dir.len() - 1];
    }
    dir
}

fn normalize_dir(line: &[u8]) -> Option<BString> {
    let dir = strip_slashes(line.trim());
    if dir.is_empty() {
        None
    } else {
        Some(BString::from(dir))
    }
}

/// The restricted shape cone-mode files must follow.
fn cone_shaped(positives: &[BString], negatives: &[BString]) -> bool {
    if positives.is_empty() {
        return true;
    }
    let positives_ok = positives.iter().all(|p| {
        p.as_slice() == b"/*" || (p.len() >= 3 && p[0] == b'/' && p.last() == Some(&b'/'))
    });
    let negatives_ok = negatives
        .iter()
        .all(|n| n.as_slice() == b"/*/" || (n.len() >= 4 && n[0] == b'/' && n.ends_with(b"/*/")));
    positives_ok && negatives_ok
}

const GLOB_SPECIALS: &[u8] = b"*?[]\\";

fn escape(dir: &[u8]) -> BString {
    let mut out = BString::from("");
    for &b in dir {
        if GLOB_SPECIALS.contains(&b) {
            out.push(b'\\');
        }
        out.push(b);
    }
    out
}

fn unescape(pattern: &[u8]) -> BString {
    let mut out = BString::from("");
    let mut iter = pattern.iter().copied().peekable();
    while let Some(b) = iter.next() {
        if b == b'\\' && iter.peek().is_some_and(|n| GLOB_SPECIALS.contains(n)) {
            continue;
        }
        out.push(b);
    }
    out
}
