//! User-defined tree nodes and their payload encoding.
//!
//! A node serializes into a [`NodeWriter`]: plain bytes plus an ordered list
//! of child handles. Child references are written inline as a positional
//! index into that list followed by the child's content hash, so a node's
//! hash commits to its children's content but never to where they are stored.

use std::any::Any;

use arbor_bundle::{encode_bytes, encode_string, encode_varint, BundleError, ByteCursor};
use arbor_types::{ContentHash, NodeHandle, NodeLocator, NodeType};
use bytes::Bytes;

use crate::error::{StorageError, StorageResult};
use crate::node_ref::TreeNodeRef;

/// Hash and revision bookkeeping embedded in every node.
///
/// The hash is known while the node matches what was last written or read;
/// any mutation clears it and bumps the revision.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeMeta {
    hash: Option<ContentHash>,
    revision: u64,
}

impl NodeMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hash(&self) -> Option<ContentHash> {
        self.hash
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn mark_dirty(&mut self) {
        self.hash = None;
        self.revision += 1;
    }

    pub(crate) fn mark_clean(&mut self, hash: ContentHash) {
        self.hash = Some(hash);
    }
}

/// An object in a persisted tree.
///
/// ```
/// use std::any::Any;
///
/// use arbor_tree::{NodeMeta, NodeWriter, StorageResult, TreeNode};
/// use arbor_types::NodeType;
///
/// struct Note {
///     meta: NodeMeta,
///     text: String,
/// }
///
/// impl TreeNode for Note {
///     fn node_type(&self) -> NodeType {
///         NodeType::from_u128(0x6e6f7465, 1)
///     }
///     fn meta(&self) -> &NodeMeta {
///         &self.meta
///     }
///     fn meta_mut(&mut self) -> &mut NodeMeta {
///         &mut self.meta
///     }
///     fn serialize(&self, writer: &mut NodeWriter) -> StorageResult<()> {
///         writer.write_string(&self.text);
///         Ok(())
///     }
///     fn as_any(&self) -> &dyn Any {
///         self
///     }
///     fn as_any_mut(&mut self) -> &mut dyn Any {
///         self
///     }
/// }
/// ```
pub trait TreeNode: Any + Send + Sync {
    fn node_type(&self) -> NodeType;

    fn meta(&self) -> &NodeMeta;

    fn meta_mut(&mut self) -> &mut NodeMeta;

    fn serialize(&self, writer: &mut NodeWriter) -> StorageResult<()>;

    /// Outgoing child references, in serialization order.
    fn refs(&self) -> Vec<&TreeNodeRef> {
        Vec::new()
    }

    fn refs_mut(&mut self) -> Vec<&mut TreeNodeRef> {
        Vec::new()
    }

    /// Alias recorded on this node's export when it is written.
    fn alias(&self) -> Option<String> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A node type that can be decoded from storage.
pub trait NodeDecode: TreeNode + Sized {
    const NODE_TYPE: NodeType;

    fn deserialize(reader: &mut NodeReader<'_>) -> StorageResult<Self>;
}

/// Serialization target for one node.
#[derive(Debug, Default)]
pub struct NodeWriter {
    data: Vec<u8>,
    refs: Vec<NodeHandle>,
}

impl NodeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn write_varint(&mut self, value: u64) {
        encode_varint(&mut self.data, value);
    }

    /// Length-prefixed bytes.
    pub fn write_bytes(&mut self, value: &[u8]) {
        encode_bytes(&mut self.data, value);
    }

    pub fn write_string(&mut self, value: &str) {
        encode_string(&mut self.data, value);
    }

    pub fn write_hash(&mut self, hash: &ContentHash) {
        self.data.extend_from_slice(hash.as_bytes());
    }

    /// Raw bytes without a length prefix.
    pub fn write_raw(&mut self, value: &[u8]) {
        self.data.extend_from_slice(value);
    }

    /// Reference a child. The child must already have a handle, which is the
    /// case for every child once the tree writer has visited it.
    pub fn write_ref(&mut self, child: &TreeNodeRef) -> StorageResult<()> {
        let handle = child.handle().ok_or_else(|| {
            StorageError::Consistency("child reference has not been written".into())
        })?;
        self.write_handle(handle);
        Ok(())
    }

    /// Reference a node by handle.
    pub fn write_handle(&mut self, handle: &NodeHandle) {
        let index = self.refs.len();
        self.refs.push(handle.clone());
        self.write_varint(index as u64);
        self.write_hash(&handle.hash());
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<NodeHandle>) {
        (self.data, self.refs)
    }
}

/// Raw bytes of one stored node plus the resolved locators of its references.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeData {
    pub hash: ContentHash,
    pub node_type: NodeType,
    pub data: Bytes,
    pub refs: Vec<NodeLocator>,
}

impl NodeData {
    pub fn reader(&self) -> NodeReader<'_> {
        NodeReader::new(&self.data, &self.refs)
    }
}

/// Deserialization source for one node.
pub struct NodeReader<'a> {
    cursor: ByteCursor<'a>,
    refs: &'a [NodeLocator],
}

fn malformed(err: BundleError) -> StorageError {
    StorageError::Consistency(format!("malformed node payload: {err}"))
}

impl<'a> NodeReader<'a> {
    pub fn new(data: &'a [u8], refs: &'a [NodeLocator]) -> Self {
        Self {
            cursor: ByteCursor::new(data),
            refs,
        }
    }

    pub fn read_u8(&mut self) -> StorageResult<u8> {
        self.cursor.read_u8("node u8").map_err(malformed)
    }

    pub fn read_varint(&mut self) -> StorageResult<u64> {
        self.cursor.read_varint("node varint").map_err(malformed)
    }

    pub fn read_bytes(&mut self) -> StorageResult<&'a [u8]> {
        self.cursor.read_bytes("node bytes").map_err(malformed)
    }

    pub fn read_string(&mut self) -> StorageResult<String> {
        self.cursor.read_string("node string").map_err(malformed)
    }

    pub fn read_hash(&mut self) -> StorageResult<ContentHash> {
        self.cursor.read_hash("node hash").map_err(malformed)
    }

    pub fn read_raw(&mut self, len: usize) -> StorageResult<&'a [u8]> {
        self.cursor.read_exact(len, "node raw bytes").map_err(malformed)
    }

    /// Read a child reference as a collapsed [`TreeNodeRef`].
    pub fn read_ref(&mut self) -> StorageResult<TreeNodeRef> {
        Ok(TreeNodeRef::from_handle(self.read_handle()?))
    }

    pub fn read_handle(&mut self) -> StorageResult<NodeHandle> {
        let index = self.cursor.read_usize("node ref index").map_err(malformed)?;
        let hash = self.read_hash()?;
        let locator = self.refs.get(index).ok_or_else(|| {
            StorageError::Consistency(format!(
                "node ref index {index} out of range ({} references)",
                self.refs.len()
            ))
        })?;
        Ok(NodeHandle::new(hash, locator.clone()))
    }

    pub fn remaining(&self) -> usize {
        self.cursor.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.is_empty()
    }
}
