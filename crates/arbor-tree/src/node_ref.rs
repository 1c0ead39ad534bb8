//! Owned references between tree nodes.
//!
//! A [`TreeNodeRef`] is in one of three states:
//!
//! - *new*: the node is in memory and has never been written
//! - *resident*: the node is in memory and the ref holds a handle; clean if
//!   the node's hash still matches the handle
//! - *collapsed*: only the handle is held; [`expand`](TreeNodeRef::expand)
//!   reads the node back
//!
//! Refs are not `Clone`: each ref has exactly one owner.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arbor_types::NodeHandle;

use crate::error::{StorageError, StorageResult};
use crate::node::TreeNode;
use crate::reader::TreeReader;

pub struct TreeNodeRef {
    pub(crate) handle: Option<NodeHandle>,
    pub(crate) target: Option<Box<dyn TreeNode>>,
    /// Set by the write callback once the bundle holding this ref's last
    /// written revision is durable.
    durable: Option<Arc<AtomicBool>>,
}

impl TreeNodeRef {
    /// A ref to a node that only exists in memory.
    pub fn new(node: impl TreeNode) -> Self {
        Self::from_boxed(Box::new(node))
    }

    pub fn from_boxed(node: Box<dyn TreeNode>) -> Self {
        Self {
            handle: None,
            target: Some(node),
            durable: None,
        }
    }

    /// A collapsed ref to a stored node.
    pub fn from_handle(handle: NodeHandle) -> Self {
        Self {
            handle: Some(handle),
            target: None,
            durable: None,
        }
    }

    pub fn handle(&self) -> Option<&NodeHandle> {
        self.handle.as_ref()
    }

    pub fn is_resident(&self) -> bool {
        self.target.is_some()
    }

    pub fn is_collapsed(&self) -> bool {
        self.target.is_none()
    }

    /// True if the in-memory node differs from what the handle points at.
    pub fn is_dirty(&self) -> bool {
        match (&self.target, &self.handle) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(node), Some(handle)) => node.meta().hash() != Some(handle.hash()),
        }
    }

    pub fn target(&self) -> Option<&dyn TreeNode> {
        self.target.as_deref()
    }

    /// Mutable access to the node. Marks it dirty.
    pub fn target_mut(&mut self) -> Option<&mut dyn TreeNode> {
        let node = self.target.as_deref_mut()?;
        node.meta_mut().mark_dirty();
        Some(node)
    }

    pub fn get<T: TreeNode>(&self) -> Option<&T> {
        self.target.as_ref()?.as_any().downcast_ref::<T>()
    }

    /// Mutable, typed access to the node. Marks it dirty.
    pub fn get_mut<T: TreeNode>(&mut self) -> Option<&mut T> {
        let node = self.target.as_deref_mut()?;
        if !node.as_any().is::<T>() {
            return None;
        }
        node.meta_mut().mark_dirty();
        node.as_any_mut().downcast_mut::<T>()
    }

    /// Read the node if the ref is collapsed.
    pub async fn expand(&mut self, reader: &TreeReader) -> StorageResult<()> {
        if self.target.is_some() {
            return Ok(());
        }
        let handle = self.handle.as_ref().ok_or_else(|| {
            StorageError::Consistency("tree node ref has neither a node nor a handle".into())
        })?;
        let node = reader.read_node(handle).await?;
        self.target = Some(node);
        Ok(())
    }

    /// Expand and downcast.
    pub async fn expand_as<T: TreeNode>(&mut self, reader: &TreeReader) -> StorageResult<&T> {
        self.expand(reader).await?;
        let node = self.target.as_deref().ok_or_else(|| {
            StorageError::Consistency("expanded ref has no node".into())
        })?;
        let actual = node.node_type();
        node.as_any().downcast_ref::<T>().ok_or_else(|| {
            StorageError::Consistency(format!(
                "node of type {actual} is not a {}",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Drop the in-memory node if it is clean and its bundle has been written.
    /// Returns whether the node was dropped.
    pub fn collapse(&mut self) -> bool {
        if self.target.is_none() || self.is_dirty() {
            return false;
        }
        match &self.handle {
            Some(handle) if handle.is_resolved() => {
                self.target = None;
                true
            }
            _ => false,
        }
    }

    /// Collapse every clean ref in this subtree whose write has completed,
    /// children first. Returns the number of nodes dropped.
    pub fn collapse_written(&mut self) -> usize {
        let mut collapsed = 0;
        if let Some(node) = self.target.as_deref_mut() {
            for child in node.refs_mut() {
                collapsed += child.collapse_written();
            }
        }
        let durable = self
            .durable
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire));
        if durable && self.collapse() {
            collapsed += 1;
        }
        collapsed
    }

    /// Like [`collapse_written`](Self::collapse_written), but keeps this
    /// ref's own node resident.
    pub fn collapse_children(&mut self) -> usize {
        match self.target.as_deref_mut() {
            Some(node) => node
                .refs_mut()
                .into_iter()
                .map(TreeNodeRef::collapse_written)
                .sum(),
            None => 0,
        }
    }

    /// Record the handle this ref's node was just written under.
    pub(crate) fn set_written(&mut self, handle: NodeHandle) {
        if let Some(node) = self.target.as_deref_mut() {
            node.meta_mut().mark_clean(handle.hash());
        }
        let flag = Arc::new(AtomicBool::new(false));
        let on_write = flag.clone();
        handle.on_write(Box::new(move |_| on_write.store(true, Ordering::Release)));
        self.durable = Some(flag);
        self.handle = Some(handle);
    }
}

impl fmt::Debug for TreeNodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match (&self.target, &self.handle) {
            (Some(_), None) => "new",
            (Some(_), Some(_)) if self.is_dirty() => "dirty",
            (Some(_), Some(_)) => "resident",
            (None, _) => "collapsed",
        };
        f.debug_struct("TreeNodeRef")
            .field("state", &state)
            .field("handle", &self.handle)
            .finish()
    }
}
