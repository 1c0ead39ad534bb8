use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hash::ContentHash;

/// Declared type of a serialized node: a stable GUID plus the version of
/// the serializer that produced the bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeType {
    pub guid: Uuid,
    pub version: u32,
}

impl NodeType {
    pub const fn new(guid: Uuid, version: u32) -> Self {
        Self { guid, version }
    }

    /// Build a node type from a GUID literal, for use in `const` items.
    pub const fn from_u128(guid: u128, version: u32) -> Self {
        Self {
            guid: Uuid::from_u128(guid),
            version,
        }
    }
}

impl fmt::Debug for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeType({}/v{})", self.guid, self.version)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/v{}", self.guid, self.version)
    }
}

/// Dedup identity of a node: identical bytes under different declared types
/// are different keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub hash: ContentHash,
    pub node_type: NodeType,
}

impl NodeKey {
    pub fn new(hash: ContentHash, node_type: NodeType) -> Self {
        Self { hash, node_type }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: NodeType = NodeType::from_u128(0x1111_2222_3333_4444_5555_6666_7777_8888, 1);

    #[test]
    fn display_includes_version() {
        assert_eq!(A.to_string(), "11112222-3333-4444-5555-666677778888/v1");
    }

    #[test]
    fn keys_differ_by_type() {
        let hash = ContentHash::of(b"same");
        let b = NodeType::new(A.guid, 2);
        assert_ne!(NodeKey::new(hash, A), NodeKey::new(hash, b));
        assert_eq!(NodeKey::new(hash, A), NodeKey::new(hash, A));
    }
}
