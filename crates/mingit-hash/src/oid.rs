use std::fmt;
use std::str::FromStr;

use crate::hex::{hex_decode, hex_encode};
use crate::{HashError, OID_HEX_LEN, OID_RAW_LEN};

/// An object identifier — the content hash of an object.
///
/// Fixed-width raw digest, totally ordered by unsigned byte comparison.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; OID_RAW_LEN]);

impl ObjectId {
    /// The null OID (all zeros).
    pub const NULL: Self = Self([0u8; OID_RAW_LEN]);

    /// Create an ObjectId from exactly [`OID_RAW_LEN`] raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HashError> {
        if bytes.len() != OID_RAW_LEN {
            return Err(HashError::InvalidHashLength {
                expected: OID_RAW_LEN,
                actual: bytes.len(),
            });
        }
        let mut raw = [0u8; OID_RAW_LEN];
        raw.copy_from_slice(bytes);
        Ok(Self(raw))
    }

    /// Create an ObjectId from its raw digest array.
    pub const fn from_raw(raw: [u8; OID_RAW_LEN]) -> Self {
        Self(raw)
    }

    /// Create an ObjectId from a 40-character hex string.
    pub fn from_hex(hex: &str) -> Result<Self, HashError> {
        if hex.len() != OID_HEX_LEN {
            return Err(HashError::InvalidHexLength {
                expected: OID_HEX_LEN,
                actual: hex.len(),
            });
        }
        let mut raw = [0u8; OID_RAW_LEN];
        hex_decode(hex, &mut raw)?;
        Ok(Self(raw))
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Is this the null (all-zeros) OID?
    pub fn is_null(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Lowercase hex representation.
    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }

    /// First byte of the digest, used for fan-out bucketing.
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", &self.to_hex()[..8])
    }
}

impl FromStr for ObjectId {
    type Err = HashError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}
