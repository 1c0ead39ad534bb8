//! Explicit mapping from [`NodeType`] to decoder.

use std::collections::HashMap;

use arbor_types::NodeType;

use crate::error::{StorageError, StorageResult};
use crate::node::{NodeData, NodeDecode, NodeReader, TreeNode};

type DecodeFn = fn(&mut NodeReader<'_>) -> StorageResult<Box<dyn TreeNode>>;

fn decode_boxed<T: NodeDecode>(reader: &mut NodeReader<'_>) -> StorageResult<Box<dyn TreeNode>> {
    Ok(Box::new(T::deserialize(reader)?))
}

/// Decoders for every node type a reader may encounter.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    decoders: HashMap<NodeType, DecodeFn>,
}

impl NodeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under [`NodeDecode::NODE_TYPE`], replacing any decoder
    /// already registered for that type.
    pub fn register<T: NodeDecode>(&mut self) -> &mut Self {
        self.decoders.insert(T::NODE_TYPE, decode_boxed::<T>);
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<T: NodeDecode>(mut self) -> Self {
        self.register::<T>();
        self
    }

    pub fn contains(&self, node_type: &NodeType) -> bool {
        self.decoders.contains_key(node_type)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decode a stored node. The decoded node is clean: its hash is the
    /// stored hash.
    pub fn decode(&self, data: &NodeData) -> StorageResult<Box<dyn TreeNode>> {
        let decode = self.decoders.get(&data.node_type).ok_or_else(|| {
            StorageError::Consistency(format!(
                "no decoder registered for node type {}",
                data.node_type
            ))
        })?;
        let mut node = decode(&mut data.reader())?;
        if node.node_type() != data.node_type {
            return Err(StorageError::Consistency(format!(
                "decoder for {} produced a node of type {}",
                data.node_type,
                node.node_type()
            )));
        }
        node.meta_mut().mark_clean(data.hash);
        Ok(node)
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.decoders.keys()).finish()
    }
}
