//! Tree object model for mingit.
//!
//! The index subsystems only ever materialize *trees*: the sparse-index
//! expander walks tree objects to rebuild file entries, and the cache-tree
//! builder writes them. Blob and commit payloads stay opaque behind the
//! [`TreeSource`] capability.

pub mod store;
mod tree;

pub use store::{read_tree_recursive, MemoryStore, TreeSink, TreeSource};
pub use tree::{FileMode, Tree, TreeEntry};

use bstr::BString;
use mingit_hash::{HashError, ObjectId};

/// Errors produced by object operations.
#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    #[error("object {0} is not a tree")]
    NotATree(ObjectId),

    #[error("invalid object type: {0}")]
    InvalidType(BString),

    #[error("invalid tree entry at offset {offset}: {reason}")]
    InvalidTreeEntry { offset: usize, reason: String },

    #[error("invalid file mode: {0}")]
    InvalidFileMode(String),

    #[error(transparent)]
    Hash(#[from] HashError),
}

/// The four object types of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Blob,
    Tree,
    Commit,
    Tag,
}

impl ObjectType {
    /// Parse from the type string in object headers.
    pub fn from_bytes(s: &[u8]) -> Result<Self, ObjectError> {
        match s {
            b"blob" => Ok(Self::Blob),
            b"tree" => Ok(Self::Tree),
            b"commit" => Ok(Self::Commit),
            b"tag" => Ok(Self::Tag),
            _ => Err(ObjectError::InvalidType(BString::from(s))),
        }
    }

    /// The canonical header representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
            Self::Tag => "tag",
        }
    }
}
