//! Storage client: one backend, one node cache, one reader.

use std::sync::Arc;

use arbor_storage::{RefCacheTime, RefOptions, StorageBackend};
use arbor_types::{NodeHandle, RefName};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use tracing::info;

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::node::{NodeDecode, TreeNode};
use crate::node_cache::NodeCache;
use crate::node_ref::TreeNodeRef;
use crate::reader::TreeReader;
use crate::registry::NodeRegistry;
use crate::writer::TreeWriter;

/// Entry point for reading and writing trees against one backend.
///
/// Writers created by [`writer`](Self::writer) share the client's node cache,
/// so identical nodes written by different writers are stored once.
pub struct StorageClient {
    backend: Arc<dyn StorageBackend>,
    cache: Arc<NodeCache>,
    reader: TreeReader,
    config: StorageConfig,
}

impl StorageClient {
    /// Must be called inside a tokio runtime; the reader starts its workers
    /// immediately.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        registry: NodeRegistry,
        config: StorageConfig,
    ) -> StorageResult<Self> {
        config.validate()?;
        let cache = Arc::new(NodeCache::from_options(&config.node_cache));
        let reader = TreeReader::new(backend.clone(), Arc::new(registry), config.reader.clone())?;
        Ok(Self {
            backend,
            cache,
            reader,
            config,
        })
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn reader(&self) -> &TreeReader {
        &self.reader
    }

    pub fn node_cache(&self) -> &Arc<NodeCache> {
        &self.cache
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// A new writer sharing this client's backend and node cache.
    pub fn writer(&self) -> TreeWriter {
        TreeWriter::new(
            self.backend.clone(),
            self.cache.clone(),
            self.config.writer.clone(),
        )
    }

    pub async fn read_node(&self, handle: &NodeHandle) -> StorageResult<Box<dyn TreeNode>> {
        self.reader.read_node(handle).await
    }

    /// Read the root a ref points at, expanded and checked to be a `T`.
    pub async fn read_tree<T: NodeDecode>(&self, name: &RefName) -> StorageResult<TreeNodeRef> {
        let handle = self.read_ref_target(name, RefCacheTime::Coherent).await?;
        let mut root = TreeNodeRef::from_handle(handle);
        root.expand_as::<T>(&self.reader).await?;
        Ok(root)
    }

    pub async fn try_read_ref_target(
        &self,
        name: &RefName,
        cache_time: RefCacheTime,
    ) -> StorageResult<Option<NodeHandle>> {
        Ok(self.backend.try_read_ref_target(name, cache_time).await?)
    }

    /// Fails with [`StorageError::RefNotFound`] if the ref does not exist.
    pub async fn read_ref_target(
        &self,
        name: &RefName,
        cache_time: RefCacheTime,
    ) -> StorageResult<NodeHandle> {
        Ok(self.backend.read_ref_target(name, cache_time).await?)
    }

    /// Point a ref at a written node. Refuses handles whose bundle has not
    /// completed yet.
    pub async fn write_ref_target(
        &self,
        name: &RefName,
        target: &NodeHandle,
        options: RefOptions,
    ) -> StorageResult<()> {
        if !target.is_resolved() {
            return Err(StorageError::Consistency(format!(
                "cannot publish {name}: node {} has not been written yet",
                target.hash().short_hex()
            )));
        }
        self.backend.write_ref_target(name, target, options).await?;
        info!(ref_name = %name, target = %target, "published ref");
        Ok(())
    }

    /// Write a tree, wait for every bundle, then point `name` at its root.
    /// Written subtrees below the root are released from memory.
    pub async fn write_tree(
        &self,
        name: &RefName,
        root: &mut TreeNodeRef,
        options: RefOptions,
    ) -> StorageResult<NodeHandle> {
        let mut writer = self.writer();
        let handle = writer.write_ref(root).await?;
        writer.flush().await?;
        self.write_ref_target(name, &handle, options).await?;
        root.collapse_children();
        Ok(handle)
    }

    pub async fn delete_ref(&self, name: &RefName) -> StorageResult<bool> {
        Ok(self.backend.delete_ref(name).await?)
    }

    pub fn find_nodes_by_alias(&self, alias: &str) -> BoxStream<'static, StorageResult<NodeHandle>> {
        self.backend
            .find_nodes_by_alias(alias)
            .map_err(StorageError::from)
            .boxed()
    }
}

impl std::fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageClient")
            .field("cache", &self.cache)
            .field("reader", &self.reader)
            .finish()
    }
}
