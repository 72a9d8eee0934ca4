//! Object identity and hashing for the mingit object store.
//!
//! Provides the fixed-width [`ObjectId`] type, hex encoding/decoding, the
//! streaming [`hasher::Hasher`], and the 256-entry [`fanout::FanoutTable`]
//! used by pack and multi-pack indexes.

pub mod fanout;
pub mod hasher;
pub mod hex;
mod oid;

pub use oid::ObjectId;

/// Length in bytes of an object identifier.
pub const OID_RAW_LEN: usize = 20;

/// Length in characters of a hex-encoded object identifier.
pub const OID_HEX_LEN: usize = 2 * OID_RAW_LEN;

/// Errors produced by hash and identifier operations.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("invalid hash length: expected {expected}, got {actual}")]
    InvalidHashLength { expected: usize, actual: usize },

    #[error("invalid hex length: expected {expected}, got {actual}")]
    InvalidHexLength { expected: usize, actual: usize },

    #[error("invalid hex character {byte:#04x} at position {pos}")]
    InvalidHex { byte: u8, pos: usize },

    #[error("SHA-1 collision attack detected")]
    Sha1Collision,

    #[error("fan-out table not monotonic at bucket {bucket}")]
    NonMonotonicFanout { bucket: usize },
}
