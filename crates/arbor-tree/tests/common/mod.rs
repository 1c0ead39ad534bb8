#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arbor_storage::{
    BackendError, BackendResult, InMemoryBackend, RefCacheTime, RefOptions, StorageBackend,
};
use arbor_tree::{
    NodeDecode, NodeMeta, NodeReader, NodeRegistry, NodeWriter, StorageClient, StorageConfig,
    StorageResult, TreeNode, TreeNodeRef, TreeReader,
};
use arbor_types::{BlobLocator, ContentHash, NodeHandle, NodeType, RefName};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::FutureExt;
use tokio::sync::watch;

pub struct Leaf {
    meta: NodeMeta,
    pub value: Vec<u8>,
}

impl Leaf {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            meta: NodeMeta::new(),
            value: value.into(),
        }
    }
}

impl TreeNode for Leaf {
    fn node_type(&self) -> NodeType {
        Self::NODE_TYPE
    }
    fn meta(&self) -> &NodeMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut NodeMeta {
        &mut self.meta
    }
    fn serialize(&self, writer: &mut NodeWriter) -> StorageResult<()> {
        writer.write_bytes(&self.value);
        Ok(())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl NodeDecode for Leaf {
    const NODE_TYPE: NodeType = NodeType::from_u128(0x6c65_6166, 1);

    fn deserialize(reader: &mut NodeReader<'_>) -> StorageResult<Self> {
        Ok(Self::new(reader.read_bytes()?))
    }
}

pub struct Branch {
    meta: NodeMeta,
    pub name: String,
    pub children: Vec<TreeNodeRef>,
    pub alias: Option<String>,
}

impl Branch {
    pub fn new(name: &str, children: Vec<TreeNodeRef>) -> Self {
        Self {
            meta: NodeMeta::new(),
            name: name.to_string(),
            children,
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }
}

impl TreeNode for Branch {
    fn node_type(&self) -> NodeType {
        Self::NODE_TYPE
    }
    fn meta(&self) -> &NodeMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut NodeMeta {
        &mut self.meta
    }
    fn serialize(&self, writer: &mut NodeWriter) -> StorageResult<()> {
        writer.write_string(&self.name);
        writer.write_varint(self.children.len() as u64);
        for child in &self.children {
            writer.write_ref(child)?;
        }
        Ok(())
    }
    fn refs(&self) -> Vec<&TreeNodeRef> {
        self.children.iter().collect()
    }
    fn refs_mut(&mut self) -> Vec<&mut TreeNodeRef> {
        self.children.iter_mut().collect()
    }
    fn alias(&self) -> Option<String> {
        self.alias.clone()
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl NodeDecode for Branch {
    const NODE_TYPE: NodeType = NodeType::from_u128(0x6272_616e_6368, 1);

    fn deserialize(reader: &mut NodeReader<'_>) -> StorageResult<Self> {
        let name = reader.read_string()?;
        let count = reader.read_varint()?;
        let mut children = Vec::new();
        for _ in 0..count {
            children.push(reader.read_ref()?);
        }
        Ok(Self {
            meta: NodeMeta::new(),
            name,
            children,
            alias: None,
        })
    }
}

pub fn leaf(value: &str) -> TreeNodeRef {
    TreeNodeRef::new(Leaf::new(value))
}

pub fn branch(name: &str, children: Vec<TreeNodeRef>) -> TreeNodeRef {
    TreeNodeRef::new(Branch::new(name, children))
}

pub fn registry() -> NodeRegistry {
    NodeRegistry::new().with::<Leaf>().with::<Branch>()
}

pub fn ref_name(name: &str) -> RefName {
    RefName::new(name).unwrap()
}

pub fn client(backend: Arc<dyn StorageBackend>, config: StorageConfig) -> StorageClient {
    StorageClient::new(backend, registry(), config).unwrap()
}

/// Serialized bytes of a resident node.
pub fn serialized(node: &dyn TreeNode) -> Vec<u8> {
    let mut writer = NodeWriter::new();
    node.serialize(&mut writer).unwrap();
    writer.into_parts().0
}

/// In-memory backend with read and write gates, injected failures and
/// call counters.
pub struct TestBackend {
    pub inner: InMemoryBackend,
    gate: watch::Sender<bool>,
    read_gate: watch::Sender<bool>,
    fail_writes: AtomicUsize,
    fail_aliases: AtomicUsize,
    range_reads: AtomicUsize,
    written: Mutex<Vec<BlobLocator>>,
}

impl TestBackend {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        let (read_gate, _) = watch::channel(true);
        Self {
            inner: InMemoryBackend::new(),
            gate,
            read_gate,
            fail_writes: AtomicUsize::new(0),
            fail_aliases: AtomicUsize::new(0),
            range_reads: AtomicUsize::new(0),
            written: Mutex::new(Vec::new()),
        }
    }

    /// Hold every blob write until [`open_gate`](Self::open_gate).
    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    /// Hold every ranged read until [`open_read_gate`](Self::open_read_gate).
    pub fn close_read_gate(&self) {
        self.read_gate.send_replace(false);
    }

    pub fn open_read_gate(&self) {
        self.read_gate.send_replace(true);
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_aliases(&self, count: usize) {
        self.fail_aliases.store(count, Ordering::SeqCst);
    }

    pub fn range_reads(&self) -> usize {
        self.range_reads.load(Ordering::SeqCst)
    }

    /// Blobs in the order their writes completed.
    pub fn written(&self) -> Vec<BlobLocator> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageBackend for TestBackend {
    async fn write_blob(&self, data: Bytes, name_hint: Option<&str>) -> BackendResult<BlobLocator> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        let fail = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(BackendError::Other("injected write failure".into()));
        }
        let locator = self.inner.write_blob(data, name_hint).await?;
        self.written.lock().unwrap().push(locator.clone());
        Ok(locator)
    }

    async fn read_blob(&self, locator: &BlobLocator) -> BackendResult<Bytes> {
        self.inner.read_blob(locator).await
    }

    async fn read_blob_range(
        &self,
        locator: &BlobLocator,
        offset: usize,
        length: usize,
    ) -> BackendResult<Bytes> {
        self.range_reads.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.read_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.inner.read_blob_range(locator, offset, length).await
    }

    async fn try_read_ref_target(
        &self,
        name: &RefName,
        cache_time: RefCacheTime,
    ) -> BackendResult<Option<NodeHandle>> {
        self.inner.try_read_ref_target(name, cache_time).await
    }

    async fn write_ref_target(
        &self,
        name: &RefName,
        target: &NodeHandle,
        options: RefOptions,
    ) -> BackendResult<()> {
        self.inner.write_ref_target(name, target, options).await
    }

    async fn delete_ref(&self, name: &RefName) -> BackendResult<bool> {
        self.inner.delete_ref(name).await
    }

    async fn add_alias(&self, alias: &str, target: &NodeHandle) -> BackendResult<()> {
        let fail = self
            .fail_aliases
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(BackendError::Other("injected alias failure".into()));
        }
        self.inner.add_alias(alias, target).await
    }

    fn find_nodes_by_alias(&self, alias: &str) -> BoxStream<'static, BackendResult<NodeHandle>> {
        self.inner.find_nodes_by_alias(alias)
    }
}

/// Read a stored subtree and render it as `name[child,child]`, checking on
/// the way that every node re-serializes to the bytes it was stored as.
pub fn describe<'a>(node: TreeNodeRef, reader: &'a TreeReader) -> BoxFuture<'a, String> {
    async move {
        let mut node = node;
        node.expand(reader).await.unwrap();
        let bytes = serialized(node.target().unwrap());
        assert_eq!(ContentHash::of(&bytes), node.handle().unwrap().hash());

        if let Some(leaf) = node.get::<Leaf>() {
            return String::from_utf8(leaf.value.clone()).unwrap();
        }
        let branch = node.get::<Branch>().unwrap();
        let name = branch.name.clone();
        let children: Vec<NodeHandle> = branch
            .children
            .iter()
            .map(|child| child.handle().unwrap().clone())
            .collect();
        let mut parts = Vec::new();
        for child in children {
            parts.push(describe(TreeNodeRef::from_handle(child), reader).await);
        }
        format!("{name}[{}]", parts.join(","))
    }
    .boxed()
}
