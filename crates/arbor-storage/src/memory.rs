//! In-memory backend for tests and embedding.
//!
//! [`InMemoryBackend`] keeps blobs, refs and aliases in `HashMap`s behind
//! `RwLock`s. It is always coherent, so [`RefCacheTime`] is ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

use arbor_types::{BlobLocator, ContentHash, NodeHandle, NodeLocator, RefName};

use crate::backend::{RefCacheTime, RefOptions, StorageBackend};
use crate::error::{BackendError, BackendResult};

const DEFAULT_PREFIX: &str = "blobs";

#[derive(Clone, Debug)]
struct RefEntry {
    hash: ContentHash,
    locator: NodeLocator,
    lifetime: Option<Duration>,
    extend: bool,
    expires_at: Option<Instant>,
}

impl RefEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// An in-memory implementation of [`StorageBackend`].
///
/// Data is lost when the backend is dropped.
pub struct InMemoryBackend {
    blobs: RwLock<HashMap<BlobLocator, Bytes>>,
    refs: RwLock<HashMap<RefName, RefEntry>>,
    aliases: RwLock<HashMap<String, Vec<(ContentHash, NodeLocator)>>>,
    next_blob: AtomicU64,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            refs: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            next_blob: AtomicU64::new(1),
        }
    }

    /// Number of blobs currently stored.
    pub fn blob_count(&self) -> usize {
        self.blobs.read().map(|blobs| blobs.len()).unwrap_or(0)
    }

    /// Total bytes across all stored blobs.
    pub fn total_bytes(&self) -> usize {
        self.blobs
            .read()
            .map(|blobs| blobs.values().map(Bytes::len).sum())
            .unwrap_or(0)
    }

    /// Sorted locators of every stored blob.
    pub fn blob_locators(&self) -> Vec<BlobLocator> {
        let mut locators: Vec<BlobLocator> = self
            .blobs
            .read()
            .map(|blobs| blobs.keys().cloned().collect())
            .unwrap_or_default();
        locators.sort();
        locators
    }

    fn allocate_locator(&self, name_hint: Option<&str>) -> BackendResult<BlobLocator> {
        let n = self.next_blob.fetch_add(1, Ordering::Relaxed);
        let prefix = name_hint
            .map(|hint| hint.trim_matches('/'))
            .filter(|hint| !hint.is_empty() && BlobLocator::new(*hint).is_ok())
            .unwrap_or(DEFAULT_PREFIX);
        Ok(BlobLocator::new(format!("{prefix}/{n:08}"))?)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> BackendError {
    BackendError::LockPoisoned(e.to_string())
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn write_blob(&self, data: Bytes, name_hint: Option<&str>) -> BackendResult<BlobLocator> {
        let locator = self.allocate_locator(name_hint)?;
        let len = data.len();
        self.blobs
            .write()
            .map_err(poisoned)?
            .insert(locator.clone(), data);
        debug!(blob = %locator, bytes = len, "stored blob");
        Ok(locator)
    }

    async fn read_blob(&self, locator: &BlobLocator) -> BackendResult<Bytes> {
        let blobs = self.blobs.read().map_err(poisoned)?;
        blobs
            .get(locator)
            .cloned()
            .ok_or_else(|| BackendError::BlobNotFound(locator.clone()))
    }

    async fn read_blob_range(
        &self,
        locator: &BlobLocator,
        offset: usize,
        length: usize,
    ) -> BackendResult<Bytes> {
        let blob = self.read_blob(locator).await?;
        if offset > blob.len() {
            return Err(BackendError::RangeOutOfBounds {
                locator: locator.clone(),
                offset,
                len: blob.len(),
            });
        }
        let end = offset.saturating_add(length).min(blob.len());
        Ok(blob.slice(offset..end))
    }

    async fn try_read_ref_target(
        &self,
        name: &RefName,
        _cache_time: RefCacheTime,
    ) -> BackendResult<Option<NodeHandle>> {
        let now = Instant::now();
        let mut refs = self.refs.write().map_err(poisoned)?;
        let Some(entry) = refs.get_mut(name) else {
            return Ok(None);
        };
        if entry.is_expired(now) {
            debug!(%name, "ref expired");
            refs.remove(name);
            return Ok(None);
        }
        if entry.extend {
            entry.expires_at = entry.lifetime.map(|lifetime| now + lifetime);
        }
        Ok(Some(NodeHandle::new(entry.hash, entry.locator.clone())))
    }

    async fn write_ref_target(
        &self,
        name: &RefName,
        target: &NodeHandle,
        options: RefOptions,
    ) -> BackendResult<()> {
        let locator = target.locator().ok_or_else(|| BackendError::UnresolvedHandle {
            name: name.clone(),
            hash: target.hash(),
        })?;
        let entry = RefEntry {
            hash: target.hash(),
            locator,
            lifetime: options.lifetime,
            extend: options.extend,
            expires_at: options.lifetime.map(|lifetime| Instant::now() + lifetime),
        };
        self.refs.write().map_err(poisoned)?.insert(name.clone(), entry);
        Ok(())
    }

    async fn delete_ref(&self, name: &RefName) -> BackendResult<bool> {
        let mut refs = self.refs.write().map_err(poisoned)?;
        match refs.remove(name) {
            Some(entry) => Ok(!entry.is_expired(Instant::now())),
            None => Ok(false),
        }
    }

    async fn add_alias(&self, alias: &str, target: &NodeHandle) -> BackendResult<()> {
        let locator = target.locator().ok_or_else(|| {
            BackendError::Other(format!("alias {alias:?} targets an unwritten node"))
        })?;
        let mut aliases = self.aliases.write().map_err(poisoned)?;
        let entries = aliases.entry(alias.to_string()).or_default();
        if !entries.iter().any(|(hash, loc)| *hash == target.hash() && *loc == locator) {
            entries.push((target.hash(), locator));
        }
        Ok(())
    }

    fn find_nodes_by_alias(&self, alias: &str) -> BoxStream<'static, BackendResult<NodeHandle>> {
        let found: BackendResult<Vec<NodeHandle>> = self
            .aliases
            .read()
            .map_err(poisoned)
            .map(|aliases| {
                aliases
                    .get(alias)
                    .map(|entries| {
                        entries
                            .iter()
                            .map(|(hash, locator)| NodeHandle::new(*hash, locator.clone()))
                            .collect()
                    })
                    .unwrap_or_default()
            });
        match found {
            Ok(handles) => stream::iter(handles.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("blob_count", &self.blob_count())
            .finish()
    }
}
