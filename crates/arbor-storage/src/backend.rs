//! The [`StorageBackend`] trait: raw blobs plus named refs.
//!
//! The tree store is layered on this contract. Retention, naming and ref
//! expiry policy belong entirely to the backend.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use arbor_types::{BlobLocator, NodeHandle, RefName};

use crate::error::{BackendError, BackendResult};

/// How stale a cached ref target may be when read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefCacheTime {
    /// Read the authoritative value.
    #[default]
    Coherent,
    /// A cached value up to this age is acceptable.
    MaxAge(Duration),
}

/// Options for writing a ref.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefOptions {
    /// Time after which the ref expires. `None` keeps it forever.
    pub lifetime: Option<Duration>,
    /// Push the expiry forward every time the ref is read.
    pub extend: bool,
}

impl RefOptions {
    pub fn with_lifetime(lifetime: Duration) -> Self {
        Self {
            lifetime: Some(lifetime),
            extend: false,
        }
    }

    pub fn extending(mut self) -> Self {
        self.extend = true;
        self
    }
}

/// Storage backend for blobs and refs.
///
/// Implementations must be thread-safe. Blobs are immutable once written;
/// refs are mutable pointers to durably written nodes.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store a blob and return its locator. `name_hint` may shape the
    /// locator but never has to be honored.
    async fn write_blob(&self, data: Bytes, name_hint: Option<&str>) -> BackendResult<BlobLocator>;

    async fn read_blob(&self, locator: &BlobLocator) -> BackendResult<Bytes>;

    /// Read up to `length` bytes starting at `offset`. The result is short
    /// only when the range runs past the end of the blob; an offset beyond
    /// the end is an error.
    async fn read_blob_range(
        &self,
        locator: &BlobLocator,
        offset: usize,
        length: usize,
    ) -> BackendResult<Bytes>;

    /// Read a ref's target. Returns `Ok(None)` if the ref does not exist.
    async fn try_read_ref_target(
        &self,
        name: &RefName,
        cache_time: RefCacheTime,
    ) -> BackendResult<Option<NodeHandle>>;

    /// Read a ref's target, failing with [`BackendError::RefNotFound`] if it
    /// does not exist.
    async fn read_ref_target(
        &self,
        name: &RefName,
        cache_time: RefCacheTime,
    ) -> BackendResult<NodeHandle> {
        self.try_read_ref_target(name, cache_time)
            .await?
            .ok_or_else(|| BackendError::RefNotFound(name.clone()))
    }

    /// Point a ref at a node. The handle must be resolved.
    async fn write_ref_target(
        &self,
        name: &RefName,
        target: &NodeHandle,
        options: RefOptions,
    ) -> BackendResult<()>;

    /// Delete a ref. Returns `Ok(true)` if it existed.
    async fn delete_ref(&self, name: &RefName) -> BackendResult<bool>;

    /// Record that a written node carries an alias.
    async fn add_alias(&self, alias: &str, target: &NodeHandle) -> BackendResult<()>;

    /// Stream every node recorded under an alias.
    fn find_nodes_by_alias(&self, alias: &str) -> BoxStream<'static, BackendResult<NodeHandle>>;
}
