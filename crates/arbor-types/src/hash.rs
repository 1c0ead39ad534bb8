use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Content hash of a serialized node.
///
/// A `ContentHash` is the BLAKE3 digest of a node's serialized bytes. Identical
/// bytes always produce the same hash; the declared node type is not mixed in
/// (see [`NodeKey`](crate::NodeKey) for the dedup identity).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Number of bytes in a serialized hash.
    pub const LEN: usize = 32;

    /// The zero hash. Never produced by [`ContentHash::of`] in practice.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Hash raw bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Wrap a pre-computed digest.
    pub const fn from_hash(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// Read a hash from the first 32 bytes of `data`.
    pub fn from_slice(data: &[u8]) -> Result<Self, TypeError> {
        if data.len() < Self::LEN {
            return Err(TypeError::InvalidLength {
                expected: Self::LEN,
                actual: data.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&data[..Self::LEN]);
        Ok(Self(arr))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// The raw 32-byte digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        if bytes.len() != Self::LEN {
            return Err(TypeError::InvalidLength {
                expected: Self::LEN,
                actual: bytes.len(),
            });
        }
        Self::from_slice(&bytes)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for ContentHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}
